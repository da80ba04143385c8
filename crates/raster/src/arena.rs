//! Arena-owned frame and page chains
//!
//! Animated and multi-page containers hand the gateway several rasters at
//! once. Rather than linking rasters with circular references, a single
//! `RasterArena` owns every raster and hands out `RasterId` indices; an
//! `ImageDocument` groups those ids into pages, each page being a ring of
//! frames in display order.

use crate::Raster;

/// Index of a raster inside its owning arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterId(usize);

/// Owner of every raster produced by one decode.
#[derive(Debug, Default)]
pub struct RasterArena {
    items: Vec<Raster>,
}

impl RasterArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, raster: Raster) -> RasterId {
        self.items.push(raster);
        RasterId(self.items.len() - 1)
    }

    pub fn get(&self, id: RasterId) -> Option<&Raster> {
        self.items.get(id.0)
    }

    pub fn get_mut(&mut self, id: RasterId) -> Option<&mut Raster> {
        self.items.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A decoded image: one arena plus its page/frame structure.
///
/// Frames within a page form a circular chain (animation loop); pages form
/// a linear chain with optional neighbours.
#[derive(Debug, Default)]
pub struct ImageDocument {
    arena: RasterArena,
    pages: Vec<Vec<RasterId>>,
}

impl ImageDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document holding a single still image.
    pub fn single(raster: Raster) -> Self {
        let mut doc = Self::new();
        let mut arena = RasterArena::new();
        let id = arena.alloc(raster);
        doc.arena = arena;
        doc.pages.push(vec![id]);
        doc
    }

    /// Append a page built from the given frames. Frames are allocated in
    /// the order supplied, which is the display order of the ring.
    pub fn push_page<I>(&mut self, frames: I)
    where
        I: IntoIterator<Item = Raster>,
    {
        let ids: Vec<RasterId> = frames.into_iter().map(|f| self.arena.alloc(f)).collect();
        if !ids.is_empty() {
            self.pages.push(ids);
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn frame_count(&self, page: usize) -> usize {
        self.pages.get(page).map_or(0, Vec::len)
    }

    /// First frame of the first page, if any.
    pub fn primary(&self) -> Option<RasterId> {
        self.pages.first().and_then(|p| p.first()).copied()
    }

    pub fn raster(&self, id: RasterId) -> Option<&Raster> {
        self.arena.get(id)
    }

    pub fn raster_mut(&mut self, id: RasterId) -> Option<&mut Raster> {
        self.arena.get_mut(id)
    }

    /// Consume the document, returning the primary raster.
    pub fn into_primary(mut self) -> Option<Raster> {
        let id = self.primary()?;
        // Swap-remove is fine: the arena is being discarded.
        if id.0 < self.arena.items.len() {
            Some(self.arena.items.swap_remove(id.0))
        } else {
            None
        }
    }

    /// Next frame in a page's ring, wrapping at the end.
    pub fn frame_after(&self, page: usize, id: RasterId) -> Option<RasterId> {
        let frames = self.pages.get(page)?;
        let pos = frames.iter().position(|f| *f == id)?;
        Some(frames[(pos + 1) % frames.len()])
    }

    /// Previous frame in a page's ring, wrapping at the start.
    pub fn frame_before(&self, page: usize, id: RasterId) -> Option<RasterId> {
        let frames = self.pages.get(page)?;
        let pos = frames.iter().position(|f| *f == id)?;
        Some(frames[(pos + frames.len() - 1) % frames.len()])
    }

    /// Following page index, if one exists.
    pub fn page_after(&self, page: usize) -> Option<usize> {
        if page + 1 < self.pages.len() {
            Some(page + 1)
        } else {
            None
        }
    }

    /// Preceding page index, if one exists.
    pub fn page_before(&self, page: usize) -> Option<usize> {
        if page > 0 && page <= self.pages.len() {
            Some(page - 1)
        } else {
            None
        }
    }
}
