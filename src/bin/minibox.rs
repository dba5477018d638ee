fn main() {
    let code = minibox::cli::run();
    std::process::exit(code)
}
