fn main() -> Result<(), Box<dyn std::error::Error>> {
    // servers are generated as well so tests can fake the kubelet side
    tonic_build::configure().compile_protos(
        &["proto/api.proto", "proto/pod_resources.proto"],
        &["proto"],
    )?;
    Ok(())
}
