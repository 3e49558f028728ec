//! Materials and the reference-counted cache of their stencil variants.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use indexmap::IndexMap;

/// Unique identifier for a material instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MaterialId(u64);

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

impl MaterialId {
    fn next() -> Self {
        MaterialId(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementSaturate,
    DecrementSaturate,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompareFunction {
    Disabled,
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

bitflags! {
    /// Color channels a material writes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const ALPHA = 0b0001;
        const BLUE  = 0b0010;
        const GREEN = 0b0100;
        const RED   = 0b1000;
        const ALL   = Self::ALPHA.bits() | Self::BLUE.bits() | Self::GREEN.bits() | Self::RED.bits();
    }
}

/// Stencil state of a derived material.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StencilParams {
    pub stencil_id: i32,
    pub operation: StencilOp,
    pub compare: CompareFunction,
    pub color_mask: ColorWriteMask,
    pub read_mask: u8,
    pub write_mask: u8,
}

impl StencilParams {
    /// Params with full read and write masks.
    pub fn new(
        stencil_id: i32,
        operation: StencilOp,
        compare: CompareFunction,
        color_mask: ColorWriteMask,
    ) -> Self {
        Self {
            stencil_id,
            operation,
            compare,
            color_mask,
            read_mask: u8::MAX,
            write_mask: u8::MAX,
        }
    }

    pub fn masks(mut self, read_mask: u8, write_mask: u8) -> Self {
        self.read_mask = read_mask;
        self.write_mask = write_mask;
        self
    }

    /// Params that leave a material unchanged.
    pub fn is_identity(&self) -> bool {
        self.stencil_id <= 0 && self.color_mask == ColorWriteMask::ALL
    }
}

/// A render material, shared by reference.
#[derive(Debug)]
pub struct Material {
    id: MaterialId,
    name: String,
    supports_stencil: bool,
    stencil: Option<StencilParams>,
    /// Owned by the cache; not listed with user materials
    hidden: bool,
    use_alpha_clip: bool,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Rc<Material> {
        Rc::new(Self::base(name.into(), true))
    }

    /// A material whose shader has no stencil state.
    pub fn without_stencil(name: impl Into<String>) -> Rc<Material> {
        Rc::new(Self::base(name.into(), false))
    }

    fn base(name: String, supports_stencil: bool) -> Self {
        Self {
            id: MaterialId::next(),
            name,
            supports_stencil,
            stencil: None,
            hidden: false,
            use_alpha_clip: false,
        }
    }

    fn derived(base: &Material, params: StencilParams) -> Self {
        let use_alpha_clip = params.operation != StencilOp::Keep && params.write_mask > 0;
        Self {
            id: MaterialId::next(),
            name: format!(
                "Stencil Id:{}, Op:{:?}, Comp:{:?}, WriteMask:{}, ReadMask:{}, ColorMask:{} AlphaClip:{} ({})",
                params.stencil_id,
                params.operation,
                params.compare,
                params.write_mask,
                params.read_mask,
                params.color_mask.bits(),
                use_alpha_clip,
                base.name
            ),
            supports_stencil: true,
            stencil: Some(params),
            hidden: true,
            use_alpha_clip,
        }
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_stencil(&self) -> bool {
        self.supports_stencil
    }

    pub fn stencil(&self) -> Option<StencilParams> {
        self.stencil
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn use_alpha_clip(&self) -> bool {
        self.use_alpha_clip
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct StencilKey {
    base: MaterialId,
    params: StencilParams,
}

struct CacheEntry {
    material: Rc<Material>,
    count: usize,
}

/// Reference-counted pool of stencil material variants.
///
/// Cloning the cache clones a handle; all clones share the same entries.
/// Every [`add`](Self::add) must be matched by one [`remove`](Self::remove)
/// of the returned material, or use [`acquire`](Self::acquire) to get a
/// lease that removes on drop.
#[derive(Clone, Default)]
pub struct StencilMaterialCache {
    entries: Rc<RefCell<IndexMap<StencilKey, CacheEntry>>>,
}

impl StencilMaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the variant of `base` with the given stencil state.
    ///
    /// Returns `base` itself when the params change nothing or the base has
    /// no stencil support; such results must still be passed to `remove`,
    /// which ignores them.
    pub fn add(&self, base: &Rc<Material>, params: StencilParams) -> Rc<Material> {
        if params.is_identity() {
            return base.clone();
        }
        if !base.supports_stencil() {
            log::warn!(
                "Material '{}' doesn't support stencil operations, masking won't work",
                base.name()
            );
            return base.clone();
        }

        let key = StencilKey {
            base: base.id(),
            params,
        };
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.get_mut(&key) {
            entry.count += 1;
            return entry.material.clone();
        }

        let material = Rc::new(Material::derived(base, params));
        log::trace!("Creating stencil material '{}'", material.name());
        entries.insert(
            key,
            CacheEntry {
                material: material.clone(),
                count: 1,
            },
        );
        material
    }

    /// Release one reference to a material returned by [`add`](Self::add).
    pub fn remove(&self, material: &Rc<Material>) {
        let mut entries = self.entries.borrow_mut();
        let Some(index) = entries
            .values()
            .position(|entry| Rc::ptr_eq(&entry.material, material))
        else {
            return;
        };
        let Some((_, entry)) = entries.get_index_mut(index) else {
            return;
        };
        entry.count -= 1;
        if entry.count == 0 {
            log::trace!("Destroying stencil material '{}'", material.name());
            entries.shift_remove_index(index);
        }
    }

    /// Scoped [`add`](Self::add): the lease removes the material when dropped.
    pub fn acquire(&self, base: &Rc<Material>, params: StencilParams) -> MaterialLease {
        MaterialLease {
            material: self.add(base, params),
            cache: self.clone(),
        }
    }

    /// Destroy every entry regardless of reference counts.
    pub fn clear_all(&self) {
        let mut entries = self.entries.borrow_mut();
        if !entries.is_empty() {
            log::debug!("Destroying {} cached stencil materials", entries.len());
        }
        entries.clear();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Outstanding references to a cached material; 0 if it is not cached.
    pub fn ref_count(&self, material: &Rc<Material>) -> usize {
        self.entries
            .borrow()
            .values()
            .find(|entry| Rc::ptr_eq(&entry.material, material))
            .map_or(0, |entry| entry.count)
    }
}

/// A counted reference to a cached material, released on drop.
pub struct MaterialLease {
    material: Rc<Material>,
    cache: StencilMaterialCache,
}

impl MaterialLease {
    pub fn material(&self) -> &Rc<Material> {
        &self.material
    }
}

impl Drop for MaterialLease {
    fn drop(&mut self) {
        self.cache.remove(&self.material);
    }
}
