use clap::Parser;
use wirelink::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", if cli.debug { "debug,wirelink=debug" } else { "info,wirelink=info" });
    }
    pretty_env_logger::init();

    let config = wirelink::load_config(&cli)?;

    if config.dump {
        println!("{config:#?}");
        return Ok(());
    }

    wirelink::run(config).await
}
