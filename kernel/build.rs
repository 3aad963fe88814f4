fn main() {
    println!("cargo:rerun-if-changed=linker.ld");

    // The linker script only applies to the freestanding kernel image.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
        println!("cargo:rustc-link-arg-bins=-T{manifest_dir}/linker.ld");
    }
}
