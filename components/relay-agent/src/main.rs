// External crates
use std::process::ExitCode;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[relay] error: failed to start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Main entrypoint simply delegates control to CLI layer.
    let result = runtime.block_on(relay_agent::cli::cli::run());

    // A stdin read may still be parked on a blocking thread, do not wait for it
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[relay] error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
