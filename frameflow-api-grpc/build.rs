use prost::Message;
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    let file_descriptors = protox::compile(
        [
            "proto/frameflow/common.proto",
            "proto/frameflow/master/v1/master_service.proto",
            "proto/frameflow/worker/v1/worker_service.proto",
        ],
        ["proto"],
    )?;

    std::fs::write(
        out_dir.join("services.bin"),
        file_descriptors.encode_to_vec(),
    )?;

    tonic_build::configure()
        .include_file("mod.rs")
        .compile_fds(file_descriptors)?;

    Ok(())
}
