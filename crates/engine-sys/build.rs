use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=EDGE_VEDA_ENGINE_DIR");

    // The inference engine is an external collaborator built out-of-tree
    // (llama.cpp-family wrapper exporting the engine_* C surface). When the
    // env var is unset we compile declaration-only: the bindings are only
    // reachable through the runtime's `native-engine` feature, so nothing
    // references the symbols and no link directives are needed.
    let Some(dir) = env::var_os("EDGE_VEDA_ENGINE_DIR") else {
        return;
    };

    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        panic!(
            "EDGE_VEDA_ENGINE_DIR is set but is not a directory: {}",
            dir.display()
        );
    }

    println!("cargo:rustc-link-search=native={}", dir.display());
    println!("cargo:rustc-link-lib=static=edge_veda_engine");

    // The engine links C++ objects; pull in the C++ standard library.
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "macos" || target_os == "ios" {
        println!("cargo:rustc-link-lib=c++");
    } else if target_os != "windows" {
        println!("cargo:rustc-link-lib=stdc++");
    }
}
