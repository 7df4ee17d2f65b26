//! Grids: a tree plus a transform plus a metadata map.
//!
//! Grids of every supported value type share the [`AnyGrid`] object-safe
//! interface so that heterogeneous collections can be archived together.
//! A grid's tree is held behind an `Arc`; two grids holding the same `Arc`
//! are instances of one another, and the archive writer detects that by
//! pointer identity, never by structural comparison.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compression::{compressed_values_size, MaskCompress, COMPRESS_BLOSC, COMPRESS_ZIP};
use crate::coord::{Coord, CoordBBox};
use crate::delayed::DelayedLoadMetadata;
use crate::error::{Error, Result};
use crate::metadata::{MetaMap, MetaValue};
use crate::stream::{InStream, OutStream};
use crate::transform::Transform;
use crate::tree::Tree;
use crate::value::ValueType;

// Reserved metadata keys.  Boolean-valued names begin with "is_" for
// Houdini compatibility.
pub const META_GRID_CLASS: &str = "class";
pub const META_GRID_CREATOR: &str = "creator";
pub const META_GRID_NAME: &str = "name";
pub const META_SAVE_HALF_FLOAT: &str = "is_saved_as_half_float";
pub const META_IS_LOCAL_SPACE: &str = "is_local_space";
pub const META_VECTOR_TYPE: &str = "vector_type";
pub const META_FILE_BBOX_MIN: &str = "file_bbox_min";
pub const META_FILE_BBOX_MAX: &str = "file_bbox_max";
pub const META_FILE_COMPRESSION: &str = "file_compression";
pub const META_FILE_MEM_BYTES: &str = "file_mem_bytes";
pub const META_FILE_VOXEL_COUNT: &str = "file_voxel_count";
pub const META_FILE_DELAYED_LOAD: &str = "file_delayed_load";

// ── Grid class ───────────────────────────────────────────────────────────────

pub const NUM_GRID_CLASSES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridClass {
    #[default]
    Unknown = 0,
    LevelSet = 1,
    FogVolume = 2,
    Staggered = 3,
}

impl GridClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridClass::Unknown => "unknown",
            GridClass::LevelSet => "level set",
            GridClass::FogVolume => "fog volume",
            GridClass::Staggered => "staggered",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "level set" => GridClass::LevelSet,
            "fog volume" => GridClass::FogVolume,
            "staggered" => GridClass::Staggered,
            _ => GridClass::Unknown,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => GridClass::LevelSet,
            2 => GridClass::FogVolume,
            3 => GridClass::Staggered,
            _ => GridClass::Unknown,
        }
    }
}

// ── Vector type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VecType {
    #[default]
    Invariant = 0,
    Covariant = 1,
    CovariantNormalize = 2,
    ContravariantRelative = 3,
    ContravariantAbsolute = 4,
}

impl VecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VecType::Invariant => "invariant",
            VecType::Covariant => "covariant",
            VecType::CovariantNormalize => "covariant normalize",
            VecType::ContravariantRelative => "contravariant relative",
            VecType::ContravariantAbsolute => "contravariant absolute",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "covariant" => VecType::Covariant,
            "covariant normalize" => VecType::CovariantNormalize,
            "contravariant relative" => VecType::ContravariantRelative,
            "contravariant absolute" => VecType::ContravariantAbsolute,
            _ => VecType::Invariant,
        }
    }
}

// ── AnyGrid ──────────────────────────────────────────────────────────────────

/// The type-erased grid interface consumed by the archive.
pub trait AnyGrid: Send + Sync + Any {
    fn grid_type(&self) -> &'static str;

    fn meta(&self) -> &MetaMap;
    fn meta_mut(&mut self) -> &mut MetaMap;

    fn transform(&self) -> &Transform;
    fn set_transform(&mut self, t: Transform);

    /// Identity of the underlying tree allocation.  Two grids report the
    /// same value exactly when they share a tree.
    fn tree_ptr(&self) -> usize;

    /// Adopt `parent`'s tree by reference.
    fn share_tree(&mut self, parent: &dyn AnyGrid) -> Result<()>;

    /// Adopt a deep copy of `parent`'s tree.
    fn copy_tree(&mut self, parent: &dyn AnyGrid) -> Result<()>;

    /// A new envelope sharing this grid's tree; metadata and transform are
    /// copied, so mutating the copy's metadata leaves this grid alone.
    fn shallow_copy(&self) -> Box<dyn AnyGrid>;

    fn leaf_count(&self) -> u64;
    fn active_voxel_count(&self) -> u64;
    fn mem_usage(&self) -> u64;
    fn eval_active_bbox(&self) -> CoordBBox;

    fn write_topology(&self, os: &mut OutStream<'_>) -> Result<()>;
    fn write_buffers(&self, os: &mut OutStream<'_>) -> Result<()>;
    fn read_topology(&mut self, is: &mut InStream<'_>) -> Result<()>;
    fn read_buffers(&mut self, is: &mut InStream<'_>, clip: Option<&CoordBBox>) -> Result<()>;

    /// Record per-leaf delayed-load information for this grid.  Returns
    /// false when the grid's value type does not support it.
    fn populate_delayed_load(
        &self,
        meta: &mut DelayedLoadMetadata,
        compression: u32,
    ) -> Result<bool>;

    /// The tree's background value, type-erased for stream tagging.
    fn background_any(&self) -> Arc<dyn Any + Send + Sync>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    // ── Metadata-backed accessors ────────────────────────────────────────────

    fn name(&self) -> String {
        self.meta()
            .get(META_GRID_NAME)
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_owned()
    }

    fn set_name(&mut self, name: &str) {
        self.meta_mut().remove_meta(META_GRID_NAME);
        self.meta_mut()
            .insert_meta(META_GRID_NAME, MetaValue::String(name.to_owned()));
    }

    fn creator(&self) -> String {
        self.meta()
            .get(META_GRID_CREATOR)
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_owned()
    }

    fn set_creator(&mut self, creator: &str) {
        self.meta_mut().remove_meta(META_GRID_CREATOR);
        self.meta_mut()
            .insert_meta(META_GRID_CREATOR, MetaValue::String(creator.to_owned()));
    }

    fn grid_class(&self) -> GridClass {
        self.meta()
            .get(META_GRID_CLASS)
            .and_then(|v| v.as_string())
            .map(GridClass::from_str)
            .unwrap_or_default()
    }

    fn set_grid_class(&mut self, class: GridClass) {
        self.meta_mut()
            .insert_meta(META_GRID_CLASS, MetaValue::String(class.as_str().to_owned()));
    }

    fn clear_grid_class(&mut self) {
        self.meta_mut().remove_meta(META_GRID_CLASS);
    }

    fn vector_type(&self) -> VecType {
        self.meta()
            .get(META_VECTOR_TYPE)
            .and_then(|v| v.as_string())
            .map(VecType::from_str)
            .unwrap_or_default()
    }

    fn set_vector_type(&mut self, vec_type: VecType) {
        self.meta_mut().insert_meta(
            META_VECTOR_TYPE,
            MetaValue::String(vec_type.as_str().to_owned()),
        );
    }

    fn save_float_as_half(&self) -> bool {
        self.meta()
            .get(META_SAVE_HALF_FLOAT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn set_save_float_as_half(&mut self, half: bool) {
        self.meta_mut().remove_meta(META_SAVE_HALF_FLOAT);
        self.meta_mut()
            .insert_meta(META_SAVE_HALF_FLOAT, MetaValue::Bool(half));
    }

    fn is_in_world_space(&self) -> bool {
        !self
            .meta()
            .get(META_IS_LOCAL_SPACE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn set_is_in_world_space(&mut self, world: bool) {
        self.meta_mut().remove_meta(META_IS_LOCAL_SPACE);
        self.meta_mut()
            .insert_meta(META_IS_LOCAL_SPACE, MetaValue::Bool(!world));
    }

    /// Compute and store the active-voxel statistics metadata.
    fn add_stats_metadata(&mut self) {
        let bbox = self.eval_active_bbox();
        let mem = self.mem_usage();
        let voxels = self.active_voxel_count();
        let meta = self.meta_mut();
        meta.remove_meta(META_FILE_BBOX_MIN);
        meta.remove_meta(META_FILE_BBOX_MAX);
        meta.remove_meta(META_FILE_MEM_BYTES);
        meta.remove_meta(META_FILE_VOXEL_COUNT);
        meta.insert_meta(META_FILE_BBOX_MIN, MetaValue::Vec3i(bbox.min.as_vec3i()));
        meta.insert_meta(META_FILE_BBOX_MAX, MetaValue::Vec3i(bbox.max.as_vec3i()));
        meta.insert_meta(META_FILE_MEM_BYTES, MetaValue::Int64(mem as i64));
        meta.insert_meta(META_FILE_VOXEL_COUNT, MetaValue::Int64(voxels as i64));
    }

    /// The subset of statistics metadata present on this grid.
    fn stats_metadata(&self) -> MetaMap {
        let mut out = MetaMap::new();
        for key in [
            META_FILE_BBOX_MIN,
            META_FILE_BBOX_MAX,
            META_FILE_MEM_BYTES,
            META_FILE_VOXEL_COUNT,
        ] {
            if let Some(v) = self.meta().get(key) {
                out.insert_meta(key, v.clone());
            }
        }
        out
    }

    fn write_meta(&self, os: &mut OutStream<'_>) -> Result<()> {
        self.meta().write_meta(os)
    }

    fn read_meta(&mut self, is: &mut InStream<'_>) -> Result<()> {
        *self.meta_mut() = MetaMap::read_meta(is)?;
        Ok(())
    }

    fn write_transform(&self, os: &mut OutStream<'_>) -> Result<()> {
        self.transform().write_to(os)
    }

    fn read_transform(&mut self, is: &mut InStream<'_>) -> Result<()> {
        let t = Transform::read_from(is)?;
        self.set_transform(t);
        Ok(())
    }
}

impl std::fmt::Debug for dyn AnyGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyGrid")
            .field("grid_type", &self.grid_type())
            .field("name", &self.name())
            .finish()
    }
}

// ── Grid ─────────────────────────────────────────────────────────────────────

pub struct Grid<T: ValueType> {
    meta: MetaMap,
    transform: Transform,
    tree: Arc<RwLock<Tree<T>>>,
}

impl<T: ValueType> Grid<T> {
    pub fn new(background: T) -> Self {
        Self {
            meta: MetaMap::new(),
            transform: Transform::default(),
            tree: Arc::new(RwLock::new(Tree::new(background))),
        }
    }

    /// A grid wrapping an existing tree handle.  Grids built from the same
    /// handle are instances of one another.
    pub fn from_tree(tree: Arc<RwLock<Tree<T>>>) -> Self {
        Self {
            meta: MetaMap::new(),
            transform: Transform::default(),
            tree,
        }
    }

    pub fn tree(&self) -> RwLockReadGuard<'_, Tree<T>> {
        self.tree.read()
    }

    pub fn tree_mut(&self) -> RwLockWriteGuard<'_, Tree<T>> {
        self.tree.write()
    }

    pub fn tree_handle(&self) -> Arc<RwLock<Tree<T>>> {
        Arc::clone(&self.tree)
    }

    pub fn set_value(&self, c: Coord, value: T) -> Result<()> {
        self.tree.write().set_value(c, value)
    }

    pub fn value(&self, c: Coord) -> Result<T> {
        self.tree.read().value(c)
    }

    /// Deactivate everything outside the index-space box corresponding to
    /// the given world-space box.
    pub fn clip_grid(&self, world_bbox: &crate::coord::BBoxd) -> Result<()> {
        let index_bbox = self.transform.world_to_index_node_centered(world_bbox);
        self.tree.write().clip(&index_bbox)
    }
}

impl<T: ValueType> AnyGrid for Grid<T> {
    fn grid_type(&self) -> &'static str {
        T::TREE_TYPE_NAME
    }

    fn meta(&self) -> &MetaMap {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut MetaMap {
        &mut self.meta
    }

    fn transform(&self) -> &Transform {
        &self.transform
    }

    fn set_transform(&mut self, t: Transform) {
        self.transform = t;
    }

    fn tree_ptr(&self) -> usize {
        Arc::as_ptr(&self.tree) as usize
    }

    fn share_tree(&mut self, parent: &dyn AnyGrid) -> Result<()> {
        let parent = parent
            .as_any()
            .downcast_ref::<Grid<T>>()
            .ok_or_else(|| Error::InvalidData("instance parent has a different tree type".into()))?;
        self.tree = Arc::clone(&parent.tree);
        Ok(())
    }

    fn copy_tree(&mut self, parent: &dyn AnyGrid) -> Result<()> {
        let parent = parent
            .as_any()
            .downcast_ref::<Grid<T>>()
            .ok_or_else(|| Error::InvalidData("instance parent has a different tree type".into()))?;
        self.tree = Arc::new(RwLock::new(parent.tree.read().clone()));
        Ok(())
    }

    fn shallow_copy(&self) -> Box<dyn AnyGrid> {
        Box::new(Grid {
            meta: self.meta.clone(),
            transform: self.transform.clone(),
            tree: Arc::clone(&self.tree),
        })
    }

    fn leaf_count(&self) -> u64 {
        self.tree.read().leaf_count() as u64
    }

    fn active_voxel_count(&self) -> u64 {
        self.tree.read().active_voxel_count()
    }

    fn mem_usage(&self) -> u64 {
        self.tree.read().mem_usage()
    }

    fn eval_active_bbox(&self) -> CoordBBox {
        self.tree.read().eval_active_bbox()
    }

    fn write_topology(&self, os: &mut OutStream<'_>) -> Result<()> {
        self.tree.read().write_topology(os)
    }

    fn write_buffers(&self, os: &mut OutStream<'_>) -> Result<()> {
        self.tree.read().write_buffers(os, self.save_float_as_half())
    }

    fn read_topology(&mut self, is: &mut InStream<'_>) -> Result<()> {
        self.tree.write().read_topology(is)
    }

    fn read_buffers(&mut self, is: &mut InStream<'_>, clip: Option<&CoordBBox>) -> Result<()> {
        let half = self.save_float_as_half();
        self.tree.write().read_buffers(is, half, clip)
    }

    fn populate_delayed_load(
        &self,
        meta: &mut DelayedLoadMetadata,
        compression: u32,
    ) -> Result<bool> {
        if !T::DELAYED_LOAD_SUPPORTED {
            return Ok(false);
        }
        let tree = self.tree.read();
        let leaf_count = tree.leaf_count();
        if leaf_count == 0 {
            return Ok(true);
        }
        meta.resize_mask(leaf_count);
        let record_sizes = compression & (COMPRESS_BLOSC | COMPRESS_ZIP) != 0;
        if record_sizes {
            meta.resize_compressed_size(leaf_count);
        }
        let background = tree.background();
        let half = self.save_float_as_half();

        let per_leaf = |leaf: &crate::tree::LeafNode<T>| -> Result<(u8, u64)> {
            leaf.with_values(|values| -> Result<(u8, u64)> {
                let mc = MaskCompress::analyze(leaf.value_mask(), values, background, compression);
                let size = if record_sizes {
                    let selected = MaskCompress::select(mc.metadata, leaf.value_mask(), values);
                    compressed_values_size(&selected, half, compression)? + 8
                } else {
                    0
                };
                Ok((mc.metadata, size))
            })?
        };

        // Each leaf's record is independent, so this parallelizes with no
        // synchronization beyond the final gather.
        #[cfg(feature = "parallel")]
        let computed: Result<Vec<(u8, u64)>> = {
            use rayon::prelude::*;
            let leaves: Vec<_> = tree.leaves().collect();
            leaves.par_iter().map(|leaf| per_leaf(leaf)).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let computed: Result<Vec<(u8, u64)>> = tree.leaves().map(per_leaf).collect();

        for (idx, (mask_byte, size)) in computed?.into_iter().enumerate() {
            meta.set_mask(idx, mask_byte);
            if record_sizes {
                meta.set_compressed_size(idx, size);
            }
        }
        Ok(true)
    }

    fn background_any(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(self.tree.read().background())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub type FloatGrid = Grid<f32>;
pub type DoubleGrid = Grid<f64>;
pub type Int32Grid = Grid<i32>;
pub type Int64Grid = Grid<i64>;
pub type Vec3IGrid = Grid<[i32; 3]>;
pub type Vec3SGrid = Grid<[f32; 3]>;
pub type Vec3DGrid = Grid<[f64; 3]>;

// ── Registry ─────────────────────────────────────────────────────────────────

pub type GridFactory = fn() -> Box<dyn AnyGrid>;

static GRID_REGISTRY: Lazy<Mutex<BTreeMap<String, GridFactory>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub fn is_grid_registered(name: &str) -> bool {
    GRID_REGISTRY.lock().contains_key(name)
}

pub fn register_grid(name: &str, factory: GridFactory) -> Result<()> {
    let mut registry = GRID_REGISTRY.lock();
    if registry.contains_key(name) {
        return Err(Error::TypeAlreadyRegistered(name.to_owned()));
    }
    registry.insert(name.to_owned(), factory);
    Ok(())
}

pub fn unregister_grid(name: &str) {
    GRID_REGISTRY.lock().remove(name);
}

pub fn create_grid(name: &str) -> Result<Box<dyn AnyGrid>> {
    let registry = GRID_REGISTRY.lock();
    match registry.get(name) {
        Some(factory) => Ok(factory()),
        None => Err(Error::UnregisteredGridType(name.to_owned())),
    }
}

pub fn clear_grid_registry() {
    GRID_REGISTRY.lock().clear();
}

fn make_grid<T: ValueType>() -> Box<dyn AnyGrid> {
    Box::new(Grid::<T>::new(T::default()))
}

/// Register factories for every built-in grid type.  Safe to call more
/// than once.
pub fn register_standard_types() {
    fn add<T: ValueType>() {
        if !is_grid_registered(T::TREE_TYPE_NAME) {
            let _ = register_grid(T::TREE_TYPE_NAME, make_grid::<T>);
        }
    }
    add::<f32>();
    add::<f64>();
    add::<i32>();
    add::<i64>();
    add::<[i32; 3]>();
    add::<[f32; 3]>();
    add::<[f64; 3]>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_class_strings() {
        assert_eq!(GridClass::FogVolume.as_str(), "fog volume");
        assert_eq!(GridClass::from_str("  Level Set "), GridClass::LevelSet);
        assert_eq!(GridClass::from_str("nonsense"), GridClass::Unknown);
    }

    #[test]
    fn vec_type_strings() {
        assert_eq!(
            VecType::ContravariantAbsolute.as_str(),
            "contravariant absolute"
        );
        assert_eq!(
            VecType::from_str("Covariant Normalize"),
            VecType::CovariantNormalize
        );
        assert_eq!(VecType::from_str(""), VecType::Invariant);
    }

    #[test]
    fn metadata_backed_accessors() {
        let mut grid = FloatGrid::new(0.0);
        assert_eq!(grid.name(), "");
        grid.set_name("density");
        grid.set_creator("smoke solver");
        grid.set_grid_class(GridClass::FogVolume);
        grid.set_save_float_as_half(true);
        assert_eq!(grid.name(), "density");
        assert_eq!(grid.creator(), "smoke solver");
        assert_eq!(grid.grid_class(), GridClass::FogVolume);
        assert!(grid.save_float_as_half());
        assert!(grid.is_in_world_space());
        grid.set_is_in_world_space(false);
        assert!(!grid.is_in_world_space());
    }

    #[test]
    fn shallow_copy_shares_tree_not_metadata() {
        let mut grid = FloatGrid::new(0.0);
        grid.set_name("a");
        grid.set_value(Coord::new(1, 1, 1), 2.0).unwrap();

        let mut copy = grid.shallow_copy();
        assert_eq!(copy.tree_ptr(), grid.tree_ptr());
        copy.set_name("b");
        assert_eq!(grid.name(), "a");

        // Tree mutations are visible through both envelopes.
        grid.set_value(Coord::new(2, 2, 2), 5.0).unwrap();
        let copy = copy.as_any().downcast_ref::<FloatGrid>().unwrap();
        assert_eq!(copy.value(Coord::new(2, 2, 2)).unwrap(), 5.0);
    }

    #[test]
    fn stats_metadata_round_trip() {
        let mut grid = FloatGrid::new(0.0);
        grid.set_value(Coord::new(0, 0, 0), 1.0).unwrap();
        grid.set_value(Coord::new(4, 5, 6), 1.0).unwrap();
        grid.add_stats_metadata();
        let stats = grid.stats_metadata();
        assert_eq!(
            stats.get(META_FILE_VOXEL_COUNT).and_then(|v| v.as_i64()),
            Some(2)
        );
        assert_eq!(
            stats.get(META_FILE_BBOX_MIN),
            Some(&MetaValue::Vec3i([0, 0, 0]))
        );
        assert_eq!(
            stats.get(META_FILE_BBOX_MAX),
            Some(&MetaValue::Vec3i([4, 5, 6]))
        );
    }

    #[test]
    fn share_tree_rejects_type_mismatch() {
        let parent = FloatGrid::new(0.0);
        let mut child = Int32Grid::new(0);
        assert!(child.share_tree(&parent).is_err());
    }

    #[test]
    fn registry_lifecycle() {
        register_standard_types();
        assert!(is_grid_registered("Tree_float_5_4_3"));
        let grid = create_grid("Tree_float_5_4_3").unwrap();
        assert_eq!(grid.grid_type(), "Tree_float_5_4_3");

        assert!(matches!(
            register_grid("Tree_float_5_4_3", make_grid::<f32>),
            Err(Error::TypeAlreadyRegistered(_))
        ));
        assert!(matches!(
            create_grid("Tree_bogus_5_4_3"),
            Err(Error::UnregisteredGridType(_))
        ));
    }

    #[test]
    fn populate_delayed_load_records_masks() {
        let grid = FloatGrid::new(0.0);
        grid.set_value(Coord::new(0, 0, 0), 1.0).unwrap();
        grid.set_value(Coord::new(30, 0, 0), 2.0).unwrap();
        let mut meta = DelayedLoadMetadata::new();
        let supported = grid
            .populate_delayed_load(&mut meta, crate::compression::COMPRESS_ACTIVE_MASK)
            .unwrap();
        assert!(supported);
        assert_eq!(meta.leaf_count(), 2);
        assert_eq!(
            meta.mask(0),
            Some(crate::compression::MASK_AND_NO_INACTIVE_VALS)
        );
        // No codec flag, so no sizes recorded.
        assert_eq!(meta.compressed_size(0), None);
    }
}
