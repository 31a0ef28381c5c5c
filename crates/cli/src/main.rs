use std::process::ExitCode;

fn main() -> ExitCode {
    wrkspace_cli::run()
}
