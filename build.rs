fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Only the firmware build needs the ESP-IDF environment; host test
    // builds (`--no-default-features`) skip it.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
