//! Raster pipeline registry and capability-keyed shader selection.
//!
//! Materials register (material, two-sided, attribute) raster bins once at
//! load time and receive a stable bin index. Each culling pass translates the
//! stable indices of currently visible bins into a dense per-frame index
//! space for the binning kernels. Shader variants are resolved through a
//! dispatch table built once from platform capabilities, never per draw.

use crate::error::{Error, Result};
use crate::scene::VisibilityResults;

/// Material attribute bits carried in every raster bin header.
pub mod material_flags {
    /// Masked / pixel-discard material.
    pub const MASKED: u32 = 1 << 0;
    /// Material writes pixel depth offset.
    pub const PIXEL_DEPTH_OFFSET: u32 = 1 << 1;
    /// Material uses world-position-offset vertex animation.
    pub const WORLD_POSITION_OFFSET: u32 = 1 << 2;
    /// Material uses dynamic tessellation.
    pub const DYNAMIC_TESSELLATION: u32 = 1 << 3;
}

/// Programmability-relevant material properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialAttributes {
    /// Masked / pixel-discard.
    pub masked: bool,
    /// Pixel depth offset.
    pub pixel_depth_offset: bool,
    /// World-position-offset.
    pub world_position_offset: bool,
    /// Dynamic tessellation.
    pub dynamic_tessellation: bool,
}

impl MaterialAttributes {
    /// Bit flags for the bin header (see [`material_flags`]).
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.masked {
            flags |= material_flags::MASKED;
        }
        if self.pixel_depth_offset {
            flags |= material_flags::PIXEL_DEPTH_OFFSET;
        }
        if self.world_position_offset {
            flags |= material_flags::WORLD_POSITION_OFFSET;
        }
        if self.dynamic_tessellation {
            flags |= material_flags::DYNAMIC_TESSELLATION;
        }
        flags
    }

    /// The material needs vertex-stage programmability.
    pub fn vertex_programmable(&self) -> bool {
        self.world_position_offset || self.dynamic_tessellation
    }

    /// The material needs pixel-stage programmability.
    pub fn pixel_programmable(&self) -> bool {
        self.masked || self.pixel_depth_offset
    }
}

/// A registered raster bin: one (material, two-sided, attributes) pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterBinDesc {
    /// Opaque material identifier from the material system.
    pub material_id: u32,
    /// Material attribute set.
    pub attributes: MaterialAttributes,
    /// Two-sided rasterization (backface culling off).
    pub two_sided: bool,
}

impl RasterBinDesc {
    /// The fixed-function default opaque bin used when programmable raster
    /// is disabled or a pipeline is not ready.
    pub fn default_opaque() -> Self {
        Self {
            material_id: 0,
            attributes: MaterialAttributes::default(),
            two_sided: false,
        }
    }
}

/// Stable index of a registered raster bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterBinIndex(pub u32);

/// Asynchronous precompilation state of a bin's programmable pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecacheState {
    /// Pipeline compiled and usable.
    #[default]
    Ready,
    /// Pipeline still compiling; draws substitute the fixed-function shader.
    Compiling,
}

/// Registry of raster bins, queried once per culling pass.
pub struct RasterPipelineRegistry {
    bins: Vec<RasterBinDesc>,
    precache: Vec<PrecacheState>,
    capacity: usize,
}

impl RasterPipelineRegistry {
    /// Create a registry with bin 0 pre-registered as the fixed-function
    /// default opaque bin.
    pub fn new(capacity: usize) -> Self {
        let mut registry = Self {
            bins: Vec::new(),
            precache: Vec::new(),
            capacity,
        };
        registry
            .register(RasterBinDesc::default_opaque())
            .expect("default bin fits any capacity");
        registry
    }

    /// Register a bin, returning its stable index. Registering an identical
    /// descriptor returns the existing index.
    pub fn register(&mut self, desc: RasterBinDesc) -> Result<RasterBinIndex> {
        if let Some(existing) = self.bins.iter().position(|b| *b == desc) {
            return Ok(RasterBinIndex(existing as u32));
        }
        if self.bins.len() >= self.capacity {
            return Err(Error::BinCapacityExhausted {
                registered: self.bins.len(),
                capacity: self.capacity,
            });
        }
        self.bins.push(desc);
        self.precache.push(PrecacheState::default());
        Ok(RasterBinIndex(self.bins.len() as u32 - 1))
    }

    /// Bin descriptor for a stable index.
    pub fn bin(&self, index: RasterBinIndex) -> &RasterBinDesc {
        &self.bins[index.0 as usize]
    }

    /// Number of registered bins.
    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    /// All registered bins in stable order.
    pub fn bins(&self) -> &[RasterBinDesc] {
        &self.bins
    }

    /// Update a bin's precompilation state (driven by the PSO cache).
    pub fn set_precache_state(&mut self, index: RasterBinIndex, state: PrecacheState) {
        self.precache[index.0 as usize] = state;
    }

    /// Current precompilation state of a bin.
    pub fn precache_state(&self, index: RasterBinIndex) -> PrecacheState {
        self.precache[index.0 as usize]
    }

    /// Translate the currently visible bins into dense per-frame indices.
    pub fn translate(&self, visibility: &VisibilityResults) -> BinTranslation {
        let mut dense_of_stable = vec![None; self.bins.len()];
        let mut stable_of_dense = Vec::new();
        for stable in 0..self.bins.len() {
            if visibility.is_bin_visible(stable) {
                dense_of_stable[stable] = Some(stable_of_dense.len() as u32);
                stable_of_dense.push(stable as u32);
            }
        }
        BinTranslation {
            dense_of_stable,
            stable_of_dense,
        }
    }
}

/// Stable-to-dense bin index mapping for one culling pass.
#[derive(Debug, Clone, Default)]
pub struct BinTranslation {
    dense_of_stable: Vec<Option<u32>>,
    stable_of_dense: Vec<u32>,
}

impl BinTranslation {
    /// Number of active (visible) bins this pass.
    pub fn num_active(&self) -> usize {
        self.stable_of_dense.len()
    }

    /// Dense index for a stable bin, `None` when the bin is not visible.
    pub fn dense(&self, stable: RasterBinIndex) -> Option<u32> {
        self.dense_of_stable
            .get(stable.0 as usize)
            .copied()
            .flatten()
    }

    /// Stable index for a dense slot.
    pub fn stable(&self, dense: u32) -> RasterBinIndex {
        RasterBinIndex(self.stable_of_dense[dense as usize])
    }
}

/// Platform capabilities fixed at device creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformCaps {
    /// Mesh-shader style rasterization permutations exist.
    pub mesh_shaders: bool,
    /// Native 64-bit atomics (single-word visibility writes).
    pub atomic64: bool,
    /// Efficient async compute overlap.
    pub async_compute: bool,
}

/// Key selecting a rasterization shader variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterShaderKey {
    /// Depth-only output (shadow) vs full visibility buffer.
    pub depth_only: bool,
    /// Mesh-shader hardware path.
    pub mesh_shaders: bool,
    /// Vertex-stage programmability (world-position-offset/tessellation).
    pub vertex_programmable: bool,
    /// Pixel-stage programmability (masked/pixel-depth-offset).
    pub pixel_programmable: bool,
    /// Two-sided rasterization.
    pub two_sided: bool,
    /// Virtual shadow map target.
    pub virtual_target: bool,
}

impl RasterShaderKey {
    /// Number of distinct keys.
    pub const COUNT: usize = 64;

    /// Dense table index for the key.
    pub fn index(&self) -> usize {
        (self.depth_only as usize)
            | (self.mesh_shaders as usize) << 1
            | (self.vertex_programmable as usize) << 2
            | (self.pixel_programmable as usize) << 3
            | (self.two_sided as usize) << 4
            | (self.virtual_target as usize) << 5
    }

    /// The same key with all programmability stripped (the fixed-function
    /// fallback variant).
    pub fn fixed_function(self) -> Self {
        Self {
            vertex_programmable: false,
            pixel_programmable: false,
            ..self
        }
    }

    /// Whether either stage is programmable.
    pub fn is_programmable(&self) -> bool {
        self.vertex_programmable || self.pixel_programmable
    }
}

/// Identity of the shader bound at one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Baseline shader with no material evaluation.
    FixedFunction,
    /// Per-material shader.
    Programmable,
}

/// Resolved shader identities for one bin's draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedShaders {
    /// Key of the concrete compiled variant to bind.
    pub key: RasterShaderKey,
    /// Vertex/mesh stage identity.
    pub vertex: StageKind,
    /// Pixel stage identity.
    pub pixel: StageKind,
}

/// Capability-keyed dispatch table mapping a [`RasterShaderKey`] to whether a
/// compiled variant exists. Built once at startup; unsupported permutations
/// are simply never present and selection falls back to the baseline path.
pub struct RasterShaderTable {
    supported: [bool; RasterShaderKey::COUNT],
}

impl RasterShaderTable {
    /// Build the table for the platform. Mirrors compile-time permutation
    /// gating: mesh-shader variants only exist on capable tiers.
    pub fn build(caps: &PlatformCaps) -> Self {
        let mut supported = [false; RasterShaderKey::COUNT];
        for index in 0..RasterShaderKey::COUNT {
            let mesh = index & (1 << 1) != 0;
            if mesh && !caps.mesh_shaders {
                continue;
            }
            supported[index] = true;
        }
        Self { supported }
    }

    /// Whether a compiled variant exists for the key.
    pub fn is_supported(&self, key: RasterShaderKey) -> bool {
        self.supported[key.index()]
    }

    /// Resolve the shaders for a bin draw.
    ///
    /// When the bin's programmable pipeline is still precompiling and the
    /// skip-uncached policy is active, the fixed-function variant substitutes
    /// for *both* stages — never a partial mix. Unsupported permutations
    /// (e.g. mesh shaders on a baseline tier) degrade the same way.
    pub fn select(
        &self,
        key: RasterShaderKey,
        precache: PrecacheState,
        skip_uncached: bool,
    ) -> ResolvedShaders {
        let mut resolved = key;
        if resolved.mesh_shaders && !self.is_supported(resolved) {
            resolved.mesh_shaders = false;
        }
        if resolved.is_programmable()
            && skip_uncached
            && precache == PrecacheState::Compiling
        {
            log::debug!("raster PSO not precached; substituting fixed function");
            resolved = resolved.fixed_function();
        }

        let stage = |programmable: bool| {
            if programmable {
                StageKind::Programmable
            } else {
                StageKind::FixedFunction
            }
        };
        ResolvedShaders {
            key: resolved,
            vertex: stage(resolved.vertex_programmable),
            pixel: stage(resolved.pixel_programmable),
        }
    }
}

/// Shader key for a bin under the given output mode and config.
pub fn key_for_bin(
    desc: &RasterBinDesc,
    depth_only: bool,
    virtual_target: bool,
    mesh_shaders: bool,
    programmable_raster: bool,
) -> RasterShaderKey {
    let programmable = programmable_raster;
    RasterShaderKey {
        depth_only,
        mesh_shaders,
        vertex_programmable: programmable && desc.attributes.vertex_programmable(),
        // Depth-only output still needs pixel evaluation for masked
        // materials; pixel-depth-offset only matters with a depth target.
        pixel_programmable: programmable && desc.attributes.pixel_programmable(),
        two_sided: desc.two_sided,
        virtual_target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_flags_match_properties() {
        // P2: header flags exactly mirror the material attributes.
        let attributes = MaterialAttributes {
            masked: true,
            pixel_depth_offset: false,
            world_position_offset: true,
            dynamic_tessellation: false,
        };
        let flags = attributes.flags();
        assert_eq!(
            flags,
            material_flags::MASKED | material_flags::WORLD_POSITION_OFFSET
        );
        // Idempotent: unchanged attributes give identical bytes.
        assert_eq!(flags, attributes.flags());
    }

    #[test]
    fn registry_deduplicates_and_caps() {
        let mut registry = RasterPipelineRegistry::new(3);
        let desc = RasterBinDesc {
            material_id: 7,
            attributes: MaterialAttributes::default(),
            two_sided: true,
        };
        let a = registry.register(desc).unwrap();
        let b = registry.register(desc).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.num_bins(), 2);

        registry
            .register(RasterBinDesc {
                material_id: 8,
                ..desc
            })
            .unwrap();
        let err = registry.register(RasterBinDesc {
            material_id: 9,
            ..desc
        });
        assert!(matches!(err, Err(Error::BinCapacityExhausted { .. })));
    }

    #[test]
    fn translation_is_dense_over_visible_bins() {
        let mut registry = RasterPipelineRegistry::new(8);
        for id in 1..4 {
            registry
                .register(RasterBinDesc {
                    material_id: id,
                    attributes: MaterialAttributes::default(),
                    two_sided: false,
                })
                .unwrap();
        }
        // Hide stable bin 2 (bins 0..4 exist; 0 is the default bin).
        let visibility =
            VisibilityResults::new(vec![true, true, false, true], None);
        let translation = registry.translate(&visibility);
        assert_eq!(translation.num_active(), 3);
        assert_eq!(translation.dense(RasterBinIndex(0)), Some(0));
        assert_eq!(translation.dense(RasterBinIndex(1)), Some(1));
        assert_eq!(translation.dense(RasterBinIndex(2)), None);
        assert_eq!(translation.dense(RasterBinIndex(3)), Some(2));
        assert_eq!(translation.stable(2), RasterBinIndex(3));
    }

    #[test]
    fn uncached_pso_falls_back_on_both_stages() {
        // P6: never a partial programmable-vertex + fixed-pixel mix.
        let table = RasterShaderTable::build(&PlatformCaps::default());
        let key = RasterShaderKey {
            depth_only: false,
            mesh_shaders: false,
            vertex_programmable: true,
            pixel_programmable: true,
            two_sided: false,
            virtual_target: false,
        };

        let resolved = table.select(key, PrecacheState::Compiling, true);
        assert_eq!(resolved.vertex, StageKind::FixedFunction);
        assert_eq!(resolved.pixel, StageKind::FixedFunction);
        assert!(!resolved.key.is_programmable());

        // Vertex-only programmability degrades identically.
        let vertex_only = RasterShaderKey {
            pixel_programmable: false,
            ..key
        };
        let resolved = table.select(vertex_only, PrecacheState::Compiling, true);
        assert_eq!(resolved.vertex, StageKind::FixedFunction);
        assert_eq!(resolved.pixel, StageKind::FixedFunction);
    }

    #[test]
    fn ready_pso_keeps_programmable_stages() {
        let table = RasterShaderTable::build(&PlatformCaps::default());
        let key = RasterShaderKey {
            depth_only: false,
            mesh_shaders: false,
            vertex_programmable: true,
            pixel_programmable: false,
            two_sided: false,
            virtual_target: false,
        };
        let resolved = table.select(key, PrecacheState::Ready, true);
        assert_eq!(resolved.vertex, StageKind::Programmable);
        assert_eq!(resolved.pixel, StageKind::FixedFunction);
        assert_eq!(resolved.key, key);
    }

    #[test]
    fn skip_uncached_disabled_keeps_programmable_identity() {
        let table = RasterShaderTable::build(&PlatformCaps::default());
        let key = RasterShaderKey {
            depth_only: true,
            mesh_shaders: false,
            vertex_programmable: true,
            pixel_programmable: true,
            two_sided: true,
            virtual_target: false,
        };
        let resolved = table.select(key, PrecacheState::Compiling, false);
        assert_eq!(resolved.key, key);
    }

    #[test]
    fn mesh_shader_keys_gate_on_capability() {
        let baseline = RasterShaderTable::build(&PlatformCaps::default());
        let key = RasterShaderKey {
            depth_only: false,
            mesh_shaders: true,
            vertex_programmable: false,
            pixel_programmable: false,
            two_sided: false,
            virtual_target: false,
        };
        assert!(!baseline.is_supported(key));
        // Selection silently drops to the vertex-shader tier.
        let resolved = baseline.select(key, PrecacheState::Ready, true);
        assert!(!resolved.key.mesh_shaders);

        let capable = RasterShaderTable::build(&PlatformCaps {
            mesh_shaders: true,
            ..Default::default()
        });
        assert!(capable.is_supported(key));
    }

    #[test]
    fn key_index_is_a_bijection() {
        let mut seen = [false; RasterShaderKey::COUNT];
        for bits in 0..RasterShaderKey::COUNT {
            let key = RasterShaderKey {
                depth_only: bits & 1 != 0,
                mesh_shaders: bits & 2 != 0,
                vertex_programmable: bits & 4 != 0,
                pixel_programmable: bits & 8 != 0,
                two_sided: bits & 16 != 0,
                virtual_target: bits & 32 != 0,
            };
            assert!(!seen[key.index()]);
            seen[key.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
