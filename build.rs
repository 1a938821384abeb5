fn main() {
    if !cfg!(target_os = "linux") {
        panic!(
            "{} only works on linux (ptrace-based interop debugging)",
            env!("CARGO_PKG_NAME")
        );
    }
    let supported_arch = cfg!(target_arch = "x86_64")
        || cfg!(target_arch = "x86")
        || cfg!(target_arch = "aarch64")
        || cfg!(target_arch = "arm")
        || cfg!(target_arch = "riscv64");
    if !supported_arch {
        panic!(
            "{} supports x86_64, i386, aarch64, arm32 and riscv64 targets",
            env!("CARGO_PKG_NAME")
        );
    }

    println!("cargo:rustc-link-arg=-Wl,--export-dynamic");
	println!("cargo:rustc-link-lib=lzma");
    println!("cargo:rustc-link-tests=-Wl,--export-dynamic");
}
