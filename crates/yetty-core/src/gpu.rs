//! GPU side of the card system (behind the `gpu` cargo feature).
//!
//! Everything CPU-side — allocation arithmetic, the 3-loop protocol, the
//! seqlock fabric — lives in the feature-independent modules; this module
//! owns the actual wgpu resources: the shared bind group
//! `{uniforms, metadata, storage, atlas_view, atlas_sampler, texture_buffer}`
//! and the per-frame uploads feeding it. Every buffer and texture goes
//! through [`GpuAllocator`], which keeps a labeled accounting of live GPU
//! memory.

use bytemuck::{Pod, Zeroable};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::resources::CardResourceManager;

/// Shared frame uniforms (binding 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct SharedUniforms {
    pub time: f32,
    pub delta_time: f32,
    pub screen_width: f32,
    pub screen_height: f32,
    pub mouse_x: f32,
    pub mouse_y: f32,
    _pad: [f32; 2],
}

/// Labeled accounting wrapper over wgpu resource creation. Logs every
/// create/release with a running total so leaks show up in the log, not in
/// the driver.
#[derive(Default)]
pub struct GpuAllocator {
    allocations: Vec<(String, u64)>,
    total_bytes: u64,
}

impl GpuAllocator {
    pub fn create_buffer(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        self.track(label, size);
        buffer
    }

    pub fn create_texture(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
    ) -> wgpu::Texture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.track(label, u64::from(width) * u64::from(height) * 4);
        texture
    }

    pub fn release(&mut self, label: &str) {
        if let Some(pos) = self.allocations.iter().position(|(name, _)| name == label) {
            let (name, size) = self.allocations.remove(pos);
            self.total_bytes -= size;
            info!(
                label = %name,
                size,
                total = self.total_bytes,
                "GPU [-] released"
            );
        } else {
            warn!(label, "release of untracked GPU resource");
        }
    }

    fn track(&mut self, label: &str, size: u64) {
        self.allocations.push((label.to_string(), size));
        self.total_bytes += size;
        info!(
            label,
            size,
            total = self.total_bytes,
            total_mb = self.total_bytes as f64 / (1024.0 * 1024.0),
            "GPU [+] allocated"
        );
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "{} resources, {} bytes ({:.2} MB)\n",
            self.allocations.len(),
            self.total_bytes,
            self.total_bytes as f64 / (1024.0 * 1024.0)
        );
        for (name, size) in &self.allocations {
            out.push_str(&format!("  {size:>12} B  {name}\n"));
        }
        out
    }
}

/// The card system's GPU resources and bind group.
pub struct CardGpuResources {
    uniform_buffer: wgpu::Buffer,
    metadata_buffer: wgpu::Buffer,
    storage_buffer: wgpu::Buffer,
    storage_size: u64,
    atlas_texture: wgpu::Texture,
    atlas_view: wgpu::TextureView,
    atlas_sampler: wgpu::Sampler,
    atlas_size: u32,
    texture_buffer: wgpu::Buffer,
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
}

/// Per-texture record in the texture info buffer (binding 5).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct TextureRecord {
    id: u32,
    x: u32,
    y: u32,
    size: u32, // width << 16 | height
}

const TEXTURE_BUFFER_CAPACITY: u64 = 4096 * std::mem::size_of::<TextureRecord>() as u64;

impl CardGpuResources {
    /// Create the initial resources sized to the manager's current state.
    /// The atlas binding starts as a 1x1 placeholder until the first pack.
    pub fn new(
        device: &wgpu::Device,
        allocator: &mut GpuAllocator,
        manager: &CardResourceManager,
    ) -> Result<Self> {
        let uniform_buffer = allocator.create_buffer(
            device,
            "card uniforms",
            std::mem::size_of::<SharedUniforms>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let metadata_buffer = allocator.create_buffer(
            device,
            "card metadata",
            manager.metadata().buffer_size() as u64,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let storage_size = manager.buffers().gpu_buffer_size() as u64;
        let storage_buffer = allocator.create_buffer(
            device,
            "card storage",
            storage_size,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let texture_buffer = allocator.create_buffer(
            device,
            "card texture table",
            TEXTURE_BUFFER_CAPACITY,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );

        let atlas_size = if manager.atlas().is_initialized() {
            manager.atlas().atlas_size()
        } else {
            1
        };
        let atlas_texture = allocator.create_texture(device, "card atlas", atlas_size, atlas_size);
        let atlas_view = atlas_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let atlas_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("card atlas sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..wgpu::SamplerDescriptor::default()
        });

        let layout = Self::create_layout(device);
        let bind_group = Self::create_bind_group(
            device,
            &layout,
            &uniform_buffer,
            &metadata_buffer,
            &storage_buffer,
            &atlas_view,
            &atlas_sampler,
            &texture_buffer,
        );

        Ok(Self {
            uniform_buffer,
            metadata_buffer,
            storage_buffer,
            storage_size,
            atlas_texture,
            atlas_view,
            atlas_sampler,
            atlas_size,
            texture_buffer,
            layout,
            bind_group,
        })
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn write_uniforms(&self, queue: &wgpu::Queue, uniforms: &SharedUniforms) {
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(uniforms));
    }

    /// Flush all dirty card data to the GPU, in the contract order:
    /// seqlock-guarded storage payloads, atlas dirty regions, metadata dirty
    /// ranges, then the bind group if anything was recreated.
    pub fn flush(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        allocator: &mut GpuAllocator,
        manager: &mut CardResourceManager,
    ) -> Result<()> {
        self.recreate_grown(device, allocator, manager)?;

        // 1. Storage payloads, each bracketed by its allocation's seqlock.
        let storage = &self.storage_buffer;
        let skipped = manager.buffers_mut().flush_uploads(|offset, bytes| {
            queue.write_buffer(storage, u64::from(offset), bytes);
        });
        if skipped > 0 {
            warn!(skipped, "stale card buffers this frame (writers stuck)");
        }

        // 2. Atlas dirty regions.
        if manager.atlas().is_initialized() {
            let atlas_size = manager.atlas().atlas_size();
            let image = manager.atlas().image().to_vec();
            for rect in manager.atlas_mut().take_dirty() {
                let offset = u64::from(rect.y) * u64::from(atlas_size) * 4 + u64::from(rect.x) * 4;
                queue.write_texture(
                    wgpu::ImageCopyTexture {
                        texture: &self.atlas_texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: rect.x,
                            y: rect.y,
                            z: 0,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    &image[offset as usize..],
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(atlas_size * 4),
                        rows_per_image: None,
                    },
                    wgpu::Extent3d {
                        width: rect.width,
                        height: rect.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            self.write_texture_table(queue, manager);
        }

        // 3. Metadata dirty ranges, coalesced.
        let dirty = manager.metadata_mut().take_dirty();
        for (start, end) in dirty {
            let data = &manager.metadata().data()[start as usize..end as usize];
            queue.write_buffer(&self.metadata_buffer, u64::from(start), data);
        }

        // 4. Bind group.
        if manager.bind_group_dirty() {
            self.bind_group = Self::create_bind_group(
                device,
                &self.layout,
                &self.uniform_buffer,
                &self.metadata_buffer,
                &self.storage_buffer,
                &self.atlas_view,
                &self.atlas_sampler,
                &self.texture_buffer,
            );
            manager.clear_bind_group_dirty();
            info!("card bind group rebuilt");
        }
        Ok(())
    }

    /// Recreate the storage buffer and atlas texture if the CPU side grew
    /// them. Both recreations complete before the bind group is rebuilt.
    fn recreate_grown(
        &mut self,
        device: &wgpu::Device,
        allocator: &mut GpuAllocator,
        manager: &mut CardResourceManager,
    ) -> Result<()> {
        let wanted_storage = manager.buffers().gpu_buffer_size() as u64;
        if wanted_storage != self.storage_size {
            allocator.release("card storage");
            self.storage_buffer = allocator.create_buffer(
                device,
                "card storage",
                wanted_storage,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            );
            self.storage_size = wanted_storage;
            manager.mark_bind_group_dirty();
        }

        if manager.atlas().is_initialized() {
            let wanted_atlas = manager.atlas().atlas_size();
            if wanted_atlas != self.atlas_size {
                allocator.release("card atlas");
                self.atlas_texture =
                    allocator.create_texture(device, "card atlas", wanted_atlas, wanted_atlas);
                self.atlas_view = self
                    .atlas_texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.atlas_size = wanted_atlas;
                manager.mark_bind_group_dirty();
            }
        }
        Ok(())
    }

    fn write_texture_table(&self, queue: &wgpu::Queue, manager: &CardResourceManager) {
        let records: Vec<TextureRecord> = manager
            .atlas()
            .records()
            .into_iter()
            .map(|(id, pos, width, height)| TextureRecord {
                id,
                x: pos.x,
                y: pos.y,
                size: (width << 16) | (height & 0xFFFF),
            })
            .collect();
        if records.is_empty() {
            return;
        }
        let bytes = bytemuck::cast_slice(&records);
        if bytes.len() as u64 > TEXTURE_BUFFER_CAPACITY {
            error!(count = records.len(), "texture table overflow, truncating");
            queue.write_buffer(
                &self.texture_buffer,
                0,
                &bytes[..TEXTURE_BUFFER_CAPACITY as usize],
            );
            return;
        }
        queue.write_buffer(&self.texture_buffer, 0, bytes);
    }

    fn create_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("card shared bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1),
                storage_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                storage_entry(5),
            ],
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        uniforms: &wgpu::Buffer,
        metadata: &wgpu::Buffer,
        storage: &wgpu::Buffer,
        atlas_view: &wgpu::TextureView,
        atlas_sampler: &wgpu::Sampler,
        texture_buffer: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("card shared bind group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: metadata.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: storage.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(atlas_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(atlas_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: texture_buffer.as_entire_binding(),
                },
            ],
        })
    }
}

// Device loss is fatal by contract; surface it as an error the host converts
// to an exit.
pub fn device_lost_error(reason: &str) -> Error {
    Error::Unavailable(format!("GPU device lost: {reason}"))
}
