fn main() {
    if let Err(e) = clinical_extractor_lib::run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
