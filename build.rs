fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/pathstore.proto");
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single threaded.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }
    tonic_build::compile_protos("proto/pathstore.proto")?;
    Ok(())
}
