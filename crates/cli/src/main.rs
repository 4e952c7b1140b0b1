use std::process::ExitCode;

fn main() -> ExitCode {
    apflow_cli::run()
}
