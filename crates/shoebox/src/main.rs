use clap::Parser;
use shoebox::cli::{dispatch, Cli};
use shoebox::AppConfig;
use tracing::error;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = shoebox_logging::init_logging(shoebox_logging::LogConfig {
        app_name: "shoebox",
        verbose: cli.verbose,
    }) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            eprintln!("shoebox: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let db_path = config.db_path.clone();
    match runtime.block_on(dispatch(cli, config)) {
        Ok(()) => {}
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("shoebox: {e}");
            if e.exit_code() == 2 {
                eprintln!(
                    "shoebox: catalog preserved for inspection at {}",
                    db_path.display()
                );
            }
            std::process::exit(e.exit_code());
        }
    }
}
