// Format strings for vertex streams and image pixels
//
// A format string is a whitespace separated list of `<count><type>` tokens:
//   f = f32, h = f16, i = i32, u = u32, b = u8 (normalized), x = padding bytes
// "2f 2f" is a 16 byte vertex with two vec2 attributes.

use ash::vk;

use crate::error::{Error, Result};

/// Component type of one format token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Float32,
    Float16,
    Int32,
    Uint32,
    Unorm8,
}

impl Component {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'f' => Some(Component::Float32),
            'h' => Some(Component::Float16),
            'i' => Some(Component::Int32),
            'u' => Some(Component::Uint32),
            'b' => Some(Component::Unorm8),
            _ => None,
        }
    }

    pub fn size(self) -> u32 {
        match self {
            Component::Float32 | Component::Int32 | Component::Uint32 => 4,
            Component::Float16 => 2,
            Component::Unorm8 => 1,
        }
    }

    /// Vulkan format for `count` components of this type
    fn vk_format(self, count: u32) -> Option<vk::Format> {
        use vk::Format as F;
        let format = match (self, count) {
            (Component::Float32, 1) => F::R32_SFLOAT,
            (Component::Float32, 2) => F::R32G32_SFLOAT,
            (Component::Float32, 3) => F::R32G32B32_SFLOAT,
            (Component::Float32, 4) => F::R32G32B32A32_SFLOAT,
            (Component::Float16, 1) => F::R16_SFLOAT,
            (Component::Float16, 2) => F::R16G16_SFLOAT,
            (Component::Float16, 3) => F::R16G16B16_SFLOAT,
            (Component::Float16, 4) => F::R16G16B16A16_SFLOAT,
            (Component::Int32, 1) => F::R32_SINT,
            (Component::Int32, 2) => F::R32G32_SINT,
            (Component::Int32, 3) => F::R32G32B32_SINT,
            (Component::Int32, 4) => F::R32G32B32A32_SINT,
            (Component::Uint32, 1) => F::R32_UINT,
            (Component::Uint32, 2) => F::R32G32_UINT,
            (Component::Uint32, 3) => F::R32G32B32_UINT,
            (Component::Uint32, 4) => F::R32G32B32A32_UINT,
            (Component::Unorm8, 1) => F::R8_UNORM,
            (Component::Unorm8, 2) => F::R8G8_UNORM,
            (Component::Unorm8, 3) => F::R8G8B8_UNORM,
            (Component::Unorm8, 4) => F::R8G8B8A8_UNORM,
            _ => return None,
        };
        Some(format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Attribute { component: Component, count: u32 },
    Padding(u32),
}

fn parse_tokens(format: &str) -> Result<Vec<Token>> {
    format
        .split_whitespace()
        .map(|token| {
            let split = token
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| bad_token(token))?;
            let (digits, kind) = token.split_at(split);
            let count: u32 = if digits.is_empty() {
                1
            } else {
                digits.parse().map_err(|_| bad_token(token))?
            };
            let mut chars = kind.chars();
            let c = chars.next().ok_or_else(|| bad_token(token))?;
            if chars.next().is_some() || count == 0 {
                return Err(bad_token(token));
            }
            if c == 'x' {
                return Ok(Token::Padding(count));
            }
            let component = Component::from_char(c).ok_or_else(|| bad_token(token))?;
            Ok(Token::Attribute { component, count })
        })
        .collect()
}

fn bad_token(token: &str) -> Error {
    Error::InvalidResourceDescriptor(format!("bad format token '{}'", token))
}

// =============================================================================
// VERTEX FORMAT
// =============================================================================

/// One vertex attribute at a byte offset within the stride
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub components: u32,
    pub component: Component,
    pub offset: u32,
    pub format: vk::Format,
}

/// Interleaved vertex layout parsed from a format string
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexFormat {
    pub attributes: Vec<VertexAttribute>,
    pub stride: u32,
}

impl VertexFormat {
    pub fn parse(format: &str) -> Result<Self> {
        let mut attributes = Vec::new();
        let mut offset: u32 = 0;
        for token in parse_tokens(format)? {
            match token {
                Token::Padding(bytes) => offset = grow(offset, Some(bytes))?,
                Token::Attribute { component, count } => {
                    let vk_format = component.vk_format(count).ok_or_else(|| {
                        Error::InvalidResourceDescriptor(format!(
                            "vertex attributes take 1-4 components, got {}",
                            count
                        ))
                    })?;
                    attributes.push(VertexAttribute {
                        location: attributes.len() as u32,
                        components: count,
                        component,
                        offset,
                        format: vk_format,
                    });
                    offset = grow(offset, component.size().checked_mul(count))?;
                }
            }
        }
        Ok(Self { attributes, stride: offset })
    }

    pub fn is_empty(&self) -> bool {
        self.stride == 0
    }
}

fn grow(offset: u32, bytes: Option<u32>) -> Result<u32> {
    bytes
        .and_then(|bytes| offset.checked_add(bytes))
        .ok_or_else(|| Error::InvalidResourceDescriptor("vertex stride overflows u32".into()))
}

// =============================================================================
// PIXEL FORMAT
// =============================================================================

/// Texel format of an image, e.g. "4b" for RGBA8
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub component: Component,
    pub channels: u32,
    pub format: vk::Format,
}

impl PixelFormat {
    pub fn parse(format: &str) -> Result<Self> {
        let tokens = parse_tokens(format)?;
        let (component, channels) = match tokens.as_slice() {
            [Token::Attribute { component, count }] if matches!(count, 1 | 2 | 4) => {
                (*component, *count)
            }
            _ => {
                return Err(Error::InvalidResourceDescriptor(format!(
                    "unsupported image format '{}'",
                    format
                )))
            }
        };
        let vk_format = component.vk_format(channels).ok_or_else(|| {
            Error::InvalidResourceDescriptor(format!("unsupported image format '{}'", format))
        })?;
        Ok(Self { component, channels, format: vk_format })
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.component.size() * self.channels
    }

    pub fn tag(&self) -> String {
        let c = match self.component {
            Component::Float32 => 'f',
            Component::Float16 => 'h',
            Component::Int32 => 'i',
            Component::Uint32 => 'u',
            Component::Unorm8 => 'b',
        };
        format!("{}{}", self.channels, c)
    }

    /// Integer formats need integer clear values
    pub fn clear_value(&self, color: [f32; 4]) -> vk::ClearColorValue {
        match self.component {
            Component::Int32 => vk::ClearColorValue { int32: color.map(|c| c as i32) },
            Component::Uint32 => vk::ClearColorValue { uint32: color.map(|c| c.max(0.0) as u32) },
            _ => vk::ClearColorValue { float32: color },
        }
    }

    /// One pixel of `color` in this format's byte layout
    pub fn encode_pixel(&self, color: [f32; 4]) -> Vec<u8> {
        let mut pixel = Vec::with_capacity(self.bytes_per_pixel() as usize);
        for &c in &color[..self.channels as usize] {
            match self.component {
                Component::Float32 => pixel.extend_from_slice(&c.to_le_bytes()),
                Component::Float16 => {
                    pixel.extend_from_slice(&half::f16::from_f32(c).to_le_bytes())
                }
                Component::Int32 => pixel.extend_from_slice(&(c as i32).to_le_bytes()),
                Component::Uint32 => pixel.extend_from_slice(&(c.max(0.0) as u32).to_le_bytes()),
                Component::Unorm8 => pixel.push((c.clamp(0.0, 1.0) * 255.0).round() as u8),
            }
        }
        pixel
    }
}

/// Reverse the row order of a tightly packed image in place
pub fn flip_rows(data: &mut [u8], row_bytes: usize) {
    if row_bytes == 0 {
        return;
    }
    let rows = data.len() / row_bytes;
    for top in 0..rows / 2 {
        let bottom = rows - 1 - top;
        let (head, tail) = data.split_at_mut(bottom * row_bytes);
        head[top * row_bytes..(top + 1) * row_bytes].swap_with_slice(&mut tail[..row_bytes]);
    }
}
