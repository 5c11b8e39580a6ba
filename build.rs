// Folds `debug_assertions` and the `debug-tripwire` feature into a single `tripwire` cfg.
fn main() {
  println!("cargo::rustc-check-cfg=cfg(tripwire)");
  println!("cargo::rerun-if-changed=build.rs");

  let debug = std::env::var_os("CARGO_CFG_DEBUG_ASSERTIONS").is_some();
  let forced = std::env::var_os("CARGO_FEATURE_DEBUG_TRIPWIRE").is_some();
  if debug || forced {
    println!("cargo::rustc-cfg=tripwire");
  }
}
