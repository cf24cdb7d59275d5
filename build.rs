// build.rs
// Records the build profile so the binary can warn when it runs unoptimized.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let profile = env::var("PROFILE").unwrap_or_else(|_| {
        eprintln!("[build.rs] WARN: PROFILE not set, assuming 'debug'.");
        "debug".to_string()
    });

    println!("cargo:rustc-env=COI_MCMC_BUILD_PROFILE={}", profile);
}
