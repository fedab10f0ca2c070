// Binding metadata and the checks that tie shader declarations to the
// resources a pipeline or encoder provides
//
// Shader binaries are opaque, so a stage declares its bindings and vertex
// inputs alongside the bytecode. Pipelines validate against those
// declarations at construction time.

use ash::vk;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::format::VertexFormat;

/// Descriptor kind a shader expects at a binding slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    CombinedImageSampler,
    SampledImage,
    Sampler,
    UniformBuffer,
    StorageBuffer,
    StorageImage,
}

impl BindingKind {
    pub(crate) fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            BindingKind::Sampler => vk::DescriptorType::SAMPLER,
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// One binding declared by a shader stage (descriptor set 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDecl {
    pub slot: u32,
    pub kind: BindingKind,
    pub count: u32,
}

/// A declared binding after merging every stage that uses it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StageBinding {
    pub slot: u32,
    pub kind: BindingKind,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl StageBinding {
    pub fn layout_binding(&self) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(self.slot)
            .descriptor_type(self.kind.descriptor_type())
            .descriptor_count(self.count)
            .stage_flags(self.stages)
            .build()
    }
}

/// Union of the bindings every stage declares
///
/// Two stages may share a slot only if they agree on its kind and count.
pub(crate) fn merge_declared(
    stages: &[(vk::ShaderStageFlags, &[BindingDecl])],
) -> Result<Vec<StageBinding>> {
    let mut merged: BTreeMap<u32, StageBinding> = BTreeMap::new();
    for (stage, decls) in stages {
        for decl in decls.iter() {
            match merged.get_mut(&decl.slot) {
                Some(existing) if existing.kind == decl.kind && existing.count == decl.count => {
                    existing.stages |= *stage;
                }
                Some(existing) => {
                    return Err(Error::BindingMismatch(format!(
                        "slot {} declared as {:?}[{}] and {:?}[{}]",
                        decl.slot, existing.kind, existing.count, decl.kind, decl.count
                    )));
                }
                None => {
                    merged.insert(
                        decl.slot,
                        StageBinding {
                            slot: decl.slot,
                            kind: decl.kind,
                            count: decl.count,
                            stages: *stage,
                        },
                    );
                }
            }
        }
    }
    Ok(merged.into_values().collect())
}

/// Provided resources must cover the declared slots exactly
pub(crate) fn check_bindings(declared: &[StageBinding], provided: &[BindingDecl]) -> Result<()> {
    let mut by_slot: BTreeMap<u32, &BindingDecl> = BTreeMap::new();
    for binding in provided {
        if by_slot.insert(binding.slot, binding).is_some() {
            return Err(Error::BindingMismatch(format!(
                "slot {} bound more than once",
                binding.slot
            )));
        }
    }

    for decl in declared {
        match by_slot.remove(&decl.slot) {
            None => {
                return Err(Error::BindingMismatch(format!(
                    "shader expects {:?}[{}] at slot {} but nothing is bound",
                    decl.kind, decl.count, decl.slot
                )));
            }
            Some(binding) if binding.kind != decl.kind => {
                return Err(Error::BindingMismatch(format!(
                    "slot {} expects {:?}, got {:?}",
                    decl.slot, decl.kind, binding.kind
                )));
            }
            Some(binding) if binding.count != decl.count => {
                return Err(Error::BindingMismatch(format!(
                    "slot {} expects {} resources, got {}",
                    decl.slot, decl.count, binding.count
                )));
            }
            Some(_) => {}
        }
    }

    if let Some(slot) = by_slot.keys().next() {
        return Err(Error::BindingMismatch(format!(
            "slot {} is bound but no shader stage declares it",
            slot
        )));
    }
    Ok(())
}

/// The vertex format has to feed exactly the inputs the vertex stage consumes
pub(crate) fn check_vertex_layout(format: &VertexFormat, inputs: &[u32]) -> Result<()> {
    if format.attributes.len() != inputs.len() {
        return Err(Error::VertexLayoutMismatch(format!(
            "format has {} attributes ({} byte stride), vertex stage consumes {}",
            format.attributes.len(),
            format.stride,
            inputs.len()
        )));
    }
    for (attr, &components) in format.attributes.iter().zip(inputs) {
        if attr.components != components {
            return Err(Error::VertexLayoutMismatch(format!(
                "location {} has {} components, vertex stage expects {}",
                attr.location, attr.components, components
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(slot: u32, kind: BindingKind, count: u32) -> BindingDecl {
        BindingDecl { slot, kind, count }
    }

    #[test]
    fn merges_shared_slots_across_stages() {
        let vs = [decl(0, BindingKind::UniformBuffer, 1)];
        let fs = [
            decl(0, BindingKind::UniformBuffer, 1),
            decl(1, BindingKind::CombinedImageSampler, 2),
        ];
        let merged = merge_declared(&[
            (vk::ShaderStageFlags::VERTEX, &vs[..]),
            (vk::ShaderStageFlags::FRAGMENT, &fs[..]),
        ])
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(merged[1].stages, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(merged[1].layout_binding().descriptor_count, 2);
    }

    #[test]
    fn conflicting_declarations_are_a_mismatch() {
        let vs = [decl(0, BindingKind::UniformBuffer, 1)];
        let fs = [decl(0, BindingKind::StorageBuffer, 1)];
        let err = merge_declared(&[
            (vk::ShaderStageFlags::VERTEX, &vs[..]),
            (vk::ShaderStageFlags::FRAGMENT, &fs[..]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::BindingMismatch(_)));
    }

    fn declared() -> Vec<StageBinding> {
        let fs = [decl(1, BindingKind::CombinedImageSampler, 1)];
        merge_declared(&[(vk::ShaderStageFlags::FRAGMENT, &fs[..])]).unwrap()
    }

    #[test]
    fn exact_bindings_pass() {
        check_bindings(&declared(), &[decl(1, BindingKind::CombinedImageSampler, 1)]).unwrap();
    }

    #[test]
    fn missing_extra_and_wrong_bindings_fail() {
        let cases: [&[BindingDecl]; 5] = [
            &[],
            &[decl(2, BindingKind::CombinedImageSampler, 1)],
            &[decl(1, BindingKind::SampledImage, 1)],
            &[decl(1, BindingKind::CombinedImageSampler, 2)],
            &[
                decl(1, BindingKind::CombinedImageSampler, 1),
                decl(3, BindingKind::StorageBuffer, 1),
            ],
        ];
        for provided in cases {
            assert!(
                matches!(check_bindings(&declared(), provided), Err(Error::BindingMismatch(_))),
                "{provided:?} should not match"
            );
        }
    }

    #[test]
    fn duplicate_slots_fail() {
        let provided = [
            decl(1, BindingKind::CombinedImageSampler, 1),
            decl(1, BindingKind::CombinedImageSampler, 1),
        ];
        assert!(matches!(
            check_bindings(&declared(), &provided),
            Err(Error::BindingMismatch(_))
        ));
    }

    #[test]
    fn vertex_layout_must_match_inputs() {
        let format = VertexFormat::parse("2f 2f").unwrap();
        check_vertex_layout(&format, &[2, 2]).unwrap();
        assert!(matches!(
            check_vertex_layout(&format, &[2]),
            Err(Error::VertexLayoutMismatch(_))
        ));
        assert!(matches!(
            check_vertex_layout(&format, &[2, 3]),
            Err(Error::VertexLayoutMismatch(_))
        ));
    }

    #[test]
    fn empty_layout_matches_no_inputs() {
        check_vertex_layout(&VertexFormat::default(), &[]).unwrap();
    }
}
