fn main() {
    let code = match cimd::cli::run_server() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cimserver: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
