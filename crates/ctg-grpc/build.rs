fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc so builds don't depend on a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/ctg.proto", "proto/medical_records.proto"],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
