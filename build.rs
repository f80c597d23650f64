use chrono::Local;

fn main() {
    // ESP-IDF build configuration; host test builds have none
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    // Build identifier reported over /OTAstatus, same shape as C's __DATE__ / __TIME__
    let now = Local::now();
    println!("cargo:rustc-env=BUILD_DATE={}", now.format("%b %e %Y"));
    println!("cargo:rustc-env=BUILD_TIME={}", now.format("%H:%M:%S"));

    println!("cargo:rerun-if-changed=build.rs");
}
