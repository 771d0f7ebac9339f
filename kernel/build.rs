use std::env;
use std::path::Path;

fn main() {
	println!("cargo:rerun-if-changed=linker.ld");

	// Host builds (workspace-wide `cargo check`, tests) link normally.
	if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
		return;
	}

	let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
	let script = Path::new(&manifest_dir).join("linker.ld");
	println!("cargo:rustc-link-arg-bins=-T{}", script.display());
}
