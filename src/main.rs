fn main() {
    if let Err(e) = guardplane_lib::run() {
        eprintln!("guardplane: {e:#}");
        std::process::exit(1);
    }
}
