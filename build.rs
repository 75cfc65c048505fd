fn main() {
    // Generate the ONNX protobuf bindings used by the exporter and the graph runner.
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["src/onnx/protos"])
        .input("src/onnx/protos/onnx.proto")
        .cargo_out_dir("onnx-protos")
        .run_from_script();
}
