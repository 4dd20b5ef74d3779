fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server stubs serve kubelet, client stubs register with it. Tests use the
    // opposite pair to play the kubelet side.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
