// src/main.rs

use taskdag::{cli, errors::TaskError, logging, run};

#[tokio::main]
async fn main() {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("taskdag: failed to initialise logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(args).await {
        report(&err);
        std::process::exit(err.exit_code());
    }
}

fn report(err: &TaskError) {
    // Precondition failures already printed their message through the
    // renderer; repeating the generic wrapper would just be noise.
    if !matches!(err, TaskError::PreconditionFailed { .. }) {
        eprintln!("taskdag: {err}");
    }
}
