fn main() {
    if let Err(error) = quillc_drv::main() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
