use ember::config::Config;

fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(err.exit_code());
        }
    };

    // RUST_LOG controls verbosity; the ember config's debug flag only
    // raises the default.
    let default_level = if config.ember.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    // The worker pool serving the RPCs is the tokio runtime itself, sized
    // from the configuration.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.ember.grpc_workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not build the runtime: {}", err);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        if let Some(archive) = config.system_files.clone() {
            if let Err(err) = ember::config::extract_system_files(&archive).await {
                eprintln!("{}", err);
                std::process::exit(err.exit_code());
            }
        }
        ember::server::run(config).await
    });

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}
