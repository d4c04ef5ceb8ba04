//! Build script for nacldbg-core
//!
//! Checks the minimum Rust version before compilation. The crate relies on
//! `Option::is_some_and` and `let ... else`, both stable since Rust 1.70.

fn main()
{
    let Ok(min_rust_version) = rustc_version::Version::parse("1.70.0") else {
        println!("cargo:warning=could not parse minimum Rust version");
        return;
    };

    if let Ok(rustc_version) = rustc_version::version() {
        if rustc_version < min_rust_version {
            panic!("nacldbg-core requires Rust {min_rust_version} or newer, found {rustc_version}");
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }
}
