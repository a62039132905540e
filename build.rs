// Build script for dyadio
//
// When DYAD is installed under a known prefix at build time, bake its library
// directory into the crate so `libdyad_core.so` can be found without extra
// configuration at run time.

use std::env;
use std::path::PathBuf;

fn main() {
    export_build_lib_dir();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=DYAD_INSTALL_PREFIX");
}

fn export_build_lib_dir() {
    let prefix = match env::var("DYAD_INSTALL_PREFIX") {
        Ok(p) if !p.trim().is_empty() => p,
        _ => return,
    };

    let lib_dir = PathBuf::from(prefix.trim()).join("lib");

    println!("cargo:rustc-env=DYADIO_BUILD_LIB_DIR={}", lib_dir.display());
    println!(
        "cargo:warning=dyadio will search {} for libdyad_core.so",
        lib_dir.display()
    );
}
