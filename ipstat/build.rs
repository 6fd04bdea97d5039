use std::{env, fs, path::PathBuf};

use anyhow::{anyhow, Context as _};
use aya_build::cargo_metadata;

const EBPF_PACKAGE: &str = "ipstat-ebpf";
const EBPF_OBJECT: &str = "ipstat";

fn main() -> anyhow::Result<()> {
    // Without bpf-linker the agent still builds (and its unit tests still run); loading the
    // empty object at runtime is reported as a hook setup failure.
    if let Err(err) = which::which("bpf-linker") {
        println!("cargo:warning=bpf-linker not found ({err}), embedding an empty eBPF object");
        let out_dir = env::var_os("OUT_DIR").ok_or_else(|| anyhow!("OUT_DIR not set"))?;
        let dst = PathBuf::from(out_dir).join(EBPF_OBJECT);
        fs::write(&dst, []).with_context(|| format!("failed to write {}", dst.display()))?;
        return Ok(());
    }

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    aya_build::build_ebpf([ebpf_package])
}
