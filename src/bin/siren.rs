//! siren: live-coding control shell.

use obake::siren::{self, Settings, Startup};

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("siren: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let started = match siren::start(std::env::args_os(), Settings::default()).await {
            Ok(Startup::Ready(started)) => started,
            Ok(Startup::Print(text)) => {
                print!("{text}");
                return 0;
            }
            Err(err) => {
                eprint!("{err}");
                if !err.to_string().ends_with('\n') {
                    eprintln!();
                }
                return err.exit_code();
            }
        };
        match siren::run_command_handler(started).await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!("{err:#}");
                1
            }
        }
    });

    // stdin is read on a blocking thread that cannot be cancelled.
    runtime.shutdown_background();
    std::process::exit(code);
}
