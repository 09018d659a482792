fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    // tests/native_abi.rs exports the engine entry points from the test
    // binary itself; they must land in its dynamic symbol table
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux") {
        println!("cargo:rustc-link-arg-tests=-rdynamic");
    }
}
