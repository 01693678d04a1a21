//! `nano-detect` command-line entry point

fn main() {
    if let Err(e) = nano_detect_lib::run() {
        eprintln!("nano-detect: {:#}", e);
        std::process::exit(1);
    }
}
