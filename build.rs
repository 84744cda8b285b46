fn main() {
    // Generates `built.rs` in OUT_DIR (package metadata and git commit hash).
    if let Err(err) = built::write_built_file() {
        println!("cargo:warning=failed to acquire build-time information: {err}");
    }
}
