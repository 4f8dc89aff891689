fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" for a bare CLI binary unless the
    // executable carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // The linker's `-sectcreate` flag places it in the __TEXT,__info_plist
    // section, which macOS reads like an app bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross-compiling
    // for macOS works too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    println!("cargo:rustc-link-arg-bins=-sectcreate");
    println!("cargo:rustc-link-arg-bins=__TEXT");
    println!("cargo:rustc-link-arg-bins=__info_plist");
    println!("cargo:rustc-link-arg-bins={plist}");
    println!("cargo:rerun-if-changed=Info.plist");
}
