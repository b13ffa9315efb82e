//! Build script: links the native GPTQ-Marlin kernel library.
//!
//! When the `native` feature is enabled, `libcpmcu` is linked dynamically.
//! Set `CPMCU_LIB_DIR` to the directory holding the built library; without
//! it the system linker search path is used.

fn main() {
    #[cfg(feature = "native")]
    native::link();
}

#[cfg(feature = "native")]
mod native {
    use std::env;
    use std::path::PathBuf;

    pub fn link() {
        println!("cargo:rerun-if-env-changed=CPMCU_LIB_DIR");

        if let Ok(dir) = env::var("CPMCU_LIB_DIR") {
            let dir = PathBuf::from(dir);
            assert!(
                dir.is_dir(),
                "CPMCU_LIB_DIR does not point to a directory: {}",
                dir.display()
            );
            println!("cargo:rustc-link-search=native={}", dir.display());
        } else {
            println!(
                "cargo:warning=CPMCU_LIB_DIR not set; relying on the system search path for libcpmcu"
            );
        }
        println!("cargo:rustc-link-lib=dylib=cpmcu");
    }
}
