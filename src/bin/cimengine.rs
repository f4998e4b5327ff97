fn main() {
    let code = match cimd::cli::run_engine() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cimengine: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
