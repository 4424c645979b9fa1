use std::env;

fn main() {
    let version =
        env::var("LEAFDOC_VERSION").unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap());
    println!("cargo:rerun-if-env-changed=LEAFDOC_VERSION");
    println!("cargo:rustc-env=LEAFDOC_VERSION={version}");
}
