// SPDX-License-Identifier: CEPL-1.0
use crate::texture::CUBE_FACE_COUNT;
use anyhow::{Context, Result};
use ash::vk;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingSpec {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Set 0 of both passes: camera uniform, then the per-object transform array.
pub const FRAME_BINDINGS: [BindingSpec; 2] = [
    BindingSpec {
        binding: 0,
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::VERTEX,
    },
    BindingSpec {
        binding: 1,
        ty: vk::DescriptorType::STORAGE_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::VERTEX,
    },
];

/// Set 1 of the standard pass.
pub const MESH_BINDINGS: [BindingSpec; 1] = [BindingSpec {
    binding: 0,
    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    count: 1,
    stages: vk::ShaderStageFlags::FRAGMENT,
}];

/// Set 1 of the sky pass: one sampler per cube face.
pub const SKY_BINDINGS: [BindingSpec; 1] = [BindingSpec {
    binding: 0,
    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    count: CUBE_FACE_COUNT as u32,
    stages: vk::ShaderStageFlags::FRAGMENT,
}];

pub unsafe fn create_set_layout(
    device: &ash::Device,
    bindings: &[BindingSpec],
) -> Result<vk::DescriptorSetLayout> {
    let raw: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|b| vk::DescriptorSetLayoutBinding {
            binding: b.binding,
            descriptor_type: b.ty,
            descriptor_count: b.count,
            stage_flags: b.stages,
            ..Default::default()
        })
        .collect();
    let info = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: raw.len() as u32,
        p_bindings: raw.as_ptr(),
        ..Default::default()
    };
    device
        .create_descriptor_set_layout(&info, None)
        .context("create_descriptor_set_layout")
}

/// Pool sizes for `sets` allocations of a layout built from `bindings`.
pub fn pool_sizes(bindings: &[BindingSpec], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        match sizes.iter_mut().find(|s| s.ty == b.ty) {
            Some(s) => s.descriptor_count += b.count * sets,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: b.ty,
                descriptor_count: b.count * sets,
            }),
        }
    }
    sizes
}

pub unsafe fn create_pool(
    device: &ash::Device,
    max_sets: u32,
    sizes: &[vk::DescriptorPoolSize],
) -> Result<vk::DescriptorPool> {
    let info = vk::DescriptorPoolCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
        max_sets,
        pool_size_count: sizes.len() as u32,
        p_pool_sizes: sizes.as_ptr(),
        ..Default::default()
    };
    device
        .create_descriptor_pool(&info, None)
        .context("create_descriptor_pool")
}

pub unsafe fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<vk::DescriptorSet> {
    let info = vk::DescriptorSetAllocateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
        descriptor_pool: pool,
        descriptor_set_count: 1,
        p_set_layouts: &layout,
        ..Default::default()
    };
    let sets = device
        .allocate_descriptor_sets(&info)
        .context("allocate_descriptor_sets")?;
    sets.into_iter()
        .next()
        .context("descriptor pool returned no set")
}

/// Writes one buffer into `binding` of `set`.
pub unsafe fn write_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let info = vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    };
    let write = vk::WriteDescriptorSet {
        s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
        dst_set: set,
        dst_binding: binding,
        descriptor_count: 1,
        descriptor_type: ty,
        p_buffer_info: &info,
        ..Default::default()
    };
    device.update_descriptor_sets(&[write], &[]);
}

/// The three set layouts every pipeline is built from.
#[derive(Clone, Copy, Debug)]
pub struct SetLayouts {
    pub frame: vk::DescriptorSetLayout,
    pub mesh: vk::DescriptorSetLayout,
    pub sky: vk::DescriptorSetLayout,
}

impl SetLayouts {
    pub unsafe fn create(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            frame: create_set_layout(device, &FRAME_BINDINGS).context("frame set layout")?,
            mesh: create_set_layout(device, &MESH_BINDINGS).context("mesh set layout")?,
            sky: create_set_layout(device, &SKY_BINDINGS).context("sky set layout")?,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.sky, None);
        device.destroy_descriptor_set_layout(self.mesh, None);
        device.destroy_descriptor_set_layout(self.frame, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pool_covers_every_slot() {
        // two frame sets (sky + standard) per slot, three slots
        let sizes = pool_sizes(&FRAME_BINDINGS, 6);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 6));
    }

    #[test]
    fn sampler_sizes_merge() {
        let mut bindings = MESH_BINDINGS.to_vec();
        bindings.extend_from_slice(&SKY_BINDINGS);
        let sizes = pool_sizes(&bindings, 2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[0].descriptor_count, 14);
    }
}
