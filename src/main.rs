//! hotswap - live process replacement demo
//!
//! The binary is a thin shim over the app crate, which wires the payload
//! states into the swap framework. Keeping the entry point minimal means
//! every generation of the executable re-enters through the same path.

fn main() {
    std::process::exit(hotswap_app::run());
}
