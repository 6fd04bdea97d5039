use which::which;

// Building this crate depends on the `bpf-linker` binary, which cargo knows nothing about.
// Rebuild whenever the linker found on $PATH changes.
fn main() {
    match which("bpf-linker") {
        Ok(bpf_linker) => println!("cargo:rerun-if-changed={}", bpf_linker.display()),
        Err(err) => println!("cargo:warning=bpf-linker not found: {err}"),
    }
}
