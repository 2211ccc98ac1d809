use std::env;
use std::fs::File;
use std::path::Path;

fn main() {
    // Host builds (unit tests) link against std and need none of the embedded linker setup
    let target = env::var("TARGET").unwrap_or_default();
    if !target.starts_with("thumb") {
        return;
    }

    // Create an empty memory.x file to satisfy the include in the main linker script
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("memory.x");
    File::create(&dest_path).unwrap();

    // Add the output directory to the linker search path so `link.x` can find the empty `memory.x`
    println!("cargo:rustc-link-search={}", out_dir);
    println!("cargo:rustc-link-search={}", env::var("CARGO_MANIFEST_DIR").unwrap());

    // Set linker flags for all binaries
    println!("cargo:rustc-link-arg-bins=--nmagic");

    // Cortex-M7 application core memory layout
    println!("cargo:rustc-link-arg-bin=daq-fw=-Tmemory-app.x");
    println!("cargo:rerun-if-changed=memory-app.x");

    // Main linker script, uses the memory layout from above
    println!("cargo:rustc-link-arg-bins=-Tlink.x");

    // Only link defmt if the feature is enabled
    if env::var_os("CARGO_FEATURE_DEFMT").is_some() {
        println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
    }
}
