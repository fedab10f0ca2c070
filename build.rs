// Build script to compile the demo's GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 2] = ["shaders/textured.vert", "shaders/textured.frag"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for input in SHADERS {
        compile_shader(input, &format!("{}.spv", input));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    if !input_path.exists() {
        return;
    }

    // glslc ships with the Vulkan SDK; the library builds without it
    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), demo shaders not compiled", e);
            println!("cargo:warning=  glslc {} -o {}", input, output);
        }
    }
}
