static INIT: std::sync::Once = std::sync::Once::new();

fn init_tracing_subscriber() {
    use std::io;
    use std::{env, fs};
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("AZ_TOOLKIT_LOG").unwrap_or_else(|_| EnvFilter::from("off"));
    let b = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);

    match env::var("AZ_TOOLKIT_LOG_PATH") {
        Ok(p) => {
            let f = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(p)
                .expect("open log file");
            b.with_writer(f).init();
        }
        Err(_) => {
            b.with_writer(io::stderr).init();
        }
    }
}

pub fn set_global_logger() {
    INIT.call_once(|| {
        init_tracing_subscriber();
        tracing::debug!("Logger initialized");
    });
}
