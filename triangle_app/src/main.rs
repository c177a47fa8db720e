//! Triangle demo application
//!
//! Draws a vertex-colored triangle to the swapchain back buffer. The SPIR-V
//! shaders are precompiled; see shaders/compile.sh.

use ember_engine::prelude::*;
use ember_engine::render::{VertexAttributeDescriptor, VertexDescriptor, VertexFormat, Window};
use glfw::{Action, Key, WindowEvent};
use std::path::Path;

/// Interleaved position (xy) and color (rgb), matching the vertex shader
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
];

fn load_spirv(path: &Path) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("failed to read {} ({}); run shaders/compile.sh first", path.display(), e))?;
    if bytes.len() % 4 != 0 {
        return Err(format!("{} is not a SPIR-V binary", path.display()).into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

fn triangle_shader(device: &mut GraphicsDevice) -> Result<ShaderHandle, Box<dyn std::error::Error>> {
    let shader_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
    let descriptor = ShaderModuleDescriptor {
        stages: vec![
            ShaderStageDescriptor {
                stage: ShaderStage::Vertex,
                entry_point: "main".to_string(),
                spirv: load_spirv(&shader_dir.join("triangle.vert.spv"))?,
            },
            ShaderStageDescriptor {
                stage: ShaderStage::Fragment,
                entry_point: "main".to_string(),
                spirv: load_spirv(&shader_dir.join("triangle.frag.spv"))?,
            },
        ],
        layout: ResourceLayout {
            attribute_mask: 0b11,
            render_target_mask: 0b1,
            ..Default::default()
        },
    };
    Ok(device.create_shader(&descriptor)?)
}

fn vertex_layout() -> VertexDescriptor {
    VertexDescriptor {
        attributes: vec![
            VertexAttributeDescriptor {
                location: 0,
                binding: 0,
                format: VertexFormat::Float2,
                offset: 0,
            },
            VertexAttributeDescriptor {
                location: 1,
                binding: 0,
                format: VertexFormat::Float3,
                offset: 8,
            },
        ],
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    ember_engine::init_logging();

    let settings = RenderSettings {
        title: "Ember - Triangle".to_string(),
        ..Default::default()
    };

    log::info!("Creating window {}x{}", settings.width, settings.height);
    let mut window = Window::new(&settings.title, settings.width, settings.height)?;
    let mut device = GraphicsDevice::new(&settings, Some(&mut window))?;

    let shader = triangle_shader(&mut device)?;
    let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
        shader,
        vertex_descriptor: vertex_layout(),
        primitive_topology: PrimitiveTopology::TriangleList,
    })?;

    let vertex_buffer = device.create_buffer(
        &BufferDescriptor {
            usage: BufferUsage::VERTEX,
            size: std::mem::size_of_val(&VERTICES) as u64,
            stride: std::mem::size_of::<Vertex>() as u32,
            resource_usage: ResourceUsage::Default,
        },
        Some(bytemuck::cast_slice(&VERTICES)),
    )?;

    log::info!("Entering frame loop");
    while !window.should_close() {
        window.poll_events();
        let events: Vec<WindowEvent> = window.flush_events().map(|(_, event)| event).collect();
        for event in events {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) | WindowEvent::Close => {
                    window.set_should_close(true);
                }
                WindowEvent::FramebufferSize(width, height) => {
                    if width > 0 && height > 0 {
                        device.resize(width as u32, height as u32)?;
                    }
                }
                _ => {}
            }
        }

        device.begin_frame()?;
        device.begin_render_pass(&RenderPassDescriptor::default())?;
        let topology = device.bind_render_pipeline(pipeline)?;
        device.set_vertex_buffer(0, vertex_buffer, 0, VertexInputRate::Vertex)?;
        device.draw(topology, VERTICES.len() as u32, 1, 0, 0)?;
        device.end_render_pass()?;
        device.end_frame()?;
    }

    device.wait_idle()?;
    Ok(())
}
