fn main() -> Result<(), Box<dyn std::error::Error>> {
    unsafe {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().expect("bundled protoc binary"),
        );
    }

    // Compile the node daemon protocol. The control plane is a client only;
    // the daemon side lives in the on-host agent.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/node_daemon.proto"], &["proto"])?;
    Ok(())
}
