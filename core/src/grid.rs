//! Grid addressing and cell aggregation.
//!
//! Earth is partitioned into square tiles `degrees_per_tile` on a side,
//! indexed by integer (lat, lon) pairs. A cell is a `width × width` window
//! of tiles identified by its south-west tile; windows wrap east-west in
//! longitude and clip against the poles. With width 1 cells and tiles
//! coincide.
//!
//! `GridBuilder` collects document → tile routing during ingestion, then
//! builds every populated cell in one row-major pass: link counts fold for
//! every member document (the link prior is a prior, not a training label),
//! word counts fold only for finished training-split models. The tiling map
//! dies with the builder; the finished `Grid` owns its cells in an arena
//! addressed by numeric `CellId`.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coord::{Coord, MILES_PER_DEGREE};
use crate::corpus::{DocumentTable, Split};
use crate::unigram::{GlobalUnigram, SmoothedUnigram};

/// Keeps the north pole itself out of a degenerate one-point row.
const POLE_SHAVE: f64 = 1e-10;

/// Integer tile index; `lat` grows northward, `lon` grows eastward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub lat: i32,
    pub lon: i32,
}

/// Cell identifier: an index into the grid's cell arena.
pub type CellId = u32;

/// Grid geometry fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    degrees_per_tile: f64,
    width: u32,
    min_lat: i32,
    max_lat: i32,
    min_lon: i32,
    num_lon: i32,
}

impl GridParams {
    /// Build the geometry for `degrees_per_tile` tiles and `width × width`
    /// cell windows.
    pub fn new(degrees_per_tile: f64, width: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(
            degrees_per_tile > 0.0 && degrees_per_tile.is_finite(),
            "degrees per tile must be positive, got {}",
            degrees_per_tile
        );
        anyhow::ensure!(width >= 1, "cell width must be at least 1");
        Ok(Self {
            degrees_per_tile,
            width,
            min_lat: (-90.0 / degrees_per_tile).floor() as i32,
            max_lat: ((90.0 - POLE_SHAVE) / degrees_per_tile).floor() as i32,
            min_lon: (-180.0 / degrees_per_tile).floor() as i32,
            num_lon: (360.0 / degrees_per_tile).round().max(1.0) as i32,
        })
    }

    /// Geometry from a cell size in miles.
    pub fn from_miles(miles_per_tile: f64, width: u32) -> anyhow::Result<Self> {
        Self::new(miles_per_tile / MILES_PER_DEGREE, width)
    }

    pub fn degrees_per_tile(&self) -> f64 {
        self.degrees_per_tile
    }

    pub fn miles_per_tile(&self) -> f64 {
        self.degrees_per_tile * MILES_PER_DEGREE
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Tile containing a coordinate: floor-divide, clamp latitude, wrap
    /// longitude.
    pub fn coord_to_tile(&self, coord: Coord) -> Tile {
        let lat = (coord.lat() / self.degrees_per_tile).floor() as i32;
        let lon = (coord.lon() / self.degrees_per_tile).floor() as i32;
        Tile {
            lat: lat.clamp(self.min_lat, self.max_lat),
            lon: self.wrap_lon(lon),
        }
    }

    /// Wrap a longitude index into the canonical range.
    pub fn wrap_lon(&self, lon: i32) -> i32 {
        self.min_lon + (lon - self.min_lon).rem_euclid(self.num_lon)
    }

    /// True when the latitude index lies inside the grid.
    pub fn lat_in_bounds(&self, lat: i32) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat)
    }

    /// Center of the `width × width` window anchored at `sw`.
    pub fn cell_center(&self, sw: Tile) -> Coord {
        let half = self.width as f64 * self.degrees_per_tile / 2.0;
        let lat = (sw.lat as f64 * self.degrees_per_tile + half).clamp(-90.0, 90.0);
        let lon = sw.lon as f64 * self.degrees_per_tile + half;
        Coord::new(lat, lon).expect("cell center is always a valid coordinate")
    }

    /// Boundary of the window anchored at `sw` as SW, SE, NE, NW corners,
    /// for output sinks that draw cells.
    pub fn cell_corners(&self, sw: Tile) -> [Coord; 4] {
        let span = self.width as f64 * self.degrees_per_tile;
        let south = (sw.lat as f64 * self.degrees_per_tile).clamp(-90.0, 90.0);
        let north = (south + span).clamp(-90.0, 90.0);
        let west = sw.lon as f64 * self.degrees_per_tile;
        let east = west + span;
        let corner = |lat: f64, lon: f64| {
            Coord::new(lat, lon).expect("cell corner is always a valid coordinate")
        };
        [
            corner(south, west),
            corner(south, east),
            corner(north, east),
            corner(north, west),
        ]
    }
}

/// One statistical region: a window of tiles with an aggregated language
/// model and link prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub sw_tile: Tile,
    pub model: SmoothedUnigram,
    /// Member documents whose word counts were folded in (training only).
    pub num_docs_dist: u32,
    /// Member documents whose link counts were folded in.
    pub num_docs_links: u32,
    pub incoming_links_sum: u64,
    /// Document index and link count of the best-linked member, first-seen
    /// winning ties.
    pub most_popular_doc: Option<(u32, u64)>,
}

/// The finished grid: cell arena, corner index, and counters computed in one
/// finalization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    params: GridParams,
    cells: Vec<Cell>,
    corner_to_cell: AHashMap<Tile, CellId>,
    total_docs_for_links: u64,
    total_incoming_links: u64,
    num_empty_models: usize,
}

impl Grid {
    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id as usize]
    }

    /// Cell anchored at the given south-west corner, if one was populated.
    pub fn cell_at_corner(&self, sw: Tile) -> Option<CellId> {
        self.corner_to_cell.get(&sw).copied()
    }

    /// Cell whose south-west corner is the tile containing `coord`.
    pub fn cell_for_coord(&self, coord: Coord) -> Option<CellId> {
        self.cell_at_corner(self.params.coord_to_tile(coord))
    }

    /// Center coordinate of a cell.
    pub fn cell_center(&self, id: CellId) -> Coord {
        self.params.cell_center(self.cell(id).sw_tile)
    }

    /// Boundary corners of a cell, for output sinks that draw cells.
    pub fn cell_corners(&self, id: CellId) -> [Coord; 4] {
        self.params.cell_corners(self.cell(id).sw_tile)
    }

    /// Iterate populated cells. Every yielded cell has `num_docs_links > 0`;
    /// with `nonempty_model` cells whose model observed no tokens are
    /// skipped as well.
    pub fn iter_nonempty(&self, nonempty_model: bool) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(move |c| {
            c.num_docs_links > 0 && (!nonempty_model || c.model.total_tokens() > 0)
        })
    }

    /// Denominator of the naive-Bayes link prior: Σ over cells of
    /// `num_docs_links`.
    pub fn total_docs_for_links(&self) -> u64 {
        self.total_docs_for_links
    }

    pub fn total_incoming_links(&self) -> u64 {
        self.total_incoming_links
    }

    /// Cells whose models observed no tokens (populated by non-training
    /// documents only).
    pub fn num_empty_models(&self) -> usize {
        self.num_empty_models
    }
}

/// Routes documents to tiles during ingestion, then builds the grid.
#[derive(Debug)]
pub struct GridBuilder {
    params: GridParams,
    tiling: AHashMap<Tile, Vec<u32>>,
}

impl GridBuilder {
    pub fn new(params: GridParams) -> Self {
        Self {
            params,
            tiling: AHashMap::new(),
        }
    }

    /// Route one document to its tile.
    pub fn add_document(&mut self, doc_idx: u32, coord: Coord) {
        let tile = self.params.coord_to_tile(coord);
        self.tiling.entry(tile).or_default().push(doc_idx);
    }

    pub fn num_populated_tiles(&self) -> usize {
        self.tiling.len()
    }

    /// One-pass cell construction.
    ///
    /// Every populated tile anchors a cell at its south-west corner; each
    /// cell folds the documents of all tiles in its window, clipping
    /// latitude and wrapping longitude. Cell models are finished against the
    /// background before the builder (and its tiling map) is dropped.
    ///
    /// With `link_prior_all_splits` the link prior folds documents of every
    /// split; otherwise only training documents contribute links too.
    pub fn build(
        self,
        table: &DocumentTable,
        bg: &GlobalUnigram,
        cell_min_count: u32,
        link_prior_all_splits: bool,
    ) -> Grid {
        let params = self.params;
        let width = params.width as i32;

        let mut corners: Vec<Tile> = self.tiling.keys().copied().collect();
        corners.sort();

        let mut cells: Vec<Cell> = Vec::with_capacity(corners.len());
        let mut corner_to_cell: AHashMap<Tile, CellId> = AHashMap::with_capacity(corners.len());

        for sw in corners {
            let id = cells.len() as CellId;
            let mut cell = Cell {
                id,
                sw_tile: sw,
                model: SmoothedUnigram::new(),
                num_docs_dist: 0,
                num_docs_links: 0,
                incoming_links_sum: 0,
                most_popular_doc: None,
            };

            for dlat in 0..width {
                let lat = sw.lat + dlat;
                if !params.lat_in_bounds(lat) {
                    continue;
                }
                for dlon in 0..width {
                    let tile = Tile {
                        lat,
                        lon: params.wrap_lon(sw.lon + dlon),
                    };
                    let Some(doc_ids) = self.tiling.get(&tile) else {
                        continue;
                    };
                    for &doc_idx in doc_ids {
                        fold_document(&mut cell, table, doc_idx, link_prior_all_splits);
                    }
                }
            }

            cell.model.finish(cell_min_count, bg);
            corner_to_cell.insert(sw, id);
            cells.push(cell);
        }

        let total_docs_for_links = cells.iter().map(|c| c.num_docs_links as u64).sum();
        let total_incoming_links = cells.iter().map(|c| c.incoming_links_sum).sum();
        let num_empty_models = cells.iter().filter(|c| c.model.total_tokens() == 0).count();

        info!(
            cells = cells.len(),
            empty_models = num_empty_models,
            "grid built"
        );

        Grid {
            params,
            cells,
            corner_to_cell,
            total_docs_for_links,
            total_incoming_links,
            num_empty_models,
        }
    }
}

fn fold_document(cell: &mut Cell, table: &DocumentTable, doc_idx: u32, link_prior_all_splits: bool) {
    let meta = table.doc(doc_idx);

    if link_prior_all_splits || meta.split == Split::Training {
        cell.num_docs_links += 1;
        if let Some(links) = meta.incoming_links {
            cell.incoming_links_sum += links;
            let better = match cell.most_popular_doc {
                None => true,
                Some((_, best)) => links > best,
            };
            if better {
                cell.most_popular_doc = Some((doc_idx, links));
            }
        }
    }

    if meta.split == Split::Training {
        if let Some(model) = table.model(doc_idx) {
            if model.is_finished() {
                cell.model.add_model(model);
                cell.num_docs_dist += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::DocumentMeta;

    fn params(deg: f64, width: u32) -> GridParams {
        GridParams::new(deg, width).unwrap()
    }

    fn table_with(docs: Vec<DocumentMeta>) -> DocumentTable {
        let mut t = DocumentTable::new();
        for d in docs {
            t.push_doc(d);
        }
        t
    }

    fn training_doc(title: &str, lat: f64, lon: f64, links: Option<u64>) -> DocumentMeta {
        DocumentMeta {
            id: title.to_owned(),
            title: title.to_owned(),
            split: Split::Training,
            coord: Some(Coord::new(lat, lon).unwrap()),
            incoming_links: links,
        }
    }

    #[test]
    fn floor_division_routes_negative_coords() {
        let p = params(1.0, 1);
        let t = p.coord_to_tile(Coord::new(-0.5, -0.5).unwrap());
        assert_eq!(t, Tile { lat: -1, lon: -1 });
        let t = p.coord_to_tile(Coord::new(0.5, 0.5).unwrap());
        assert_eq!(t, Tile { lat: 0, lon: 0 });
    }

    #[test]
    fn north_pole_is_shaved_into_the_top_row() {
        let p = params(1.0, 1);
        let t = p.coord_to_tile(Coord::new(90.0, 0.0).unwrap());
        assert_eq!(t.lat, 89);
        let t = p.coord_to_tile(Coord::new(-90.0, 0.0).unwrap());
        assert_eq!(t.lat, -90);
    }

    #[test]
    fn longitude_wraps_across_the_dateline() {
        let p = params(1.0, 1);
        assert_eq!(p.wrap_lon(180), -180);
        assert_eq!(p.wrap_lon(-181), 179);
        assert_eq!(p.wrap_lon(5), 5);
    }

    #[test]
    fn single_tile_world_has_one_cell() {
        let p = params(180.0, 1);
        let mut table = table_with(vec![training_doc("a", 0.0, 0.0, Some(1))]);
        let mut bg = GlobalUnigram::new();
        bg.add(0, 3);
        let mut m = SmoothedUnigram::new();
        m.add_count(0, 3);
        m.finish(1, &bg);
        table.set_model(0, m);

        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        let grid = b.build(&table, &bg, 1, true);

        assert_eq!(grid.num_cells(), 1);
        let cell = grid.iter_nonempty(true).next().unwrap();
        assert_eq!(cell.num_docs_dist, 1);
        assert_eq!(cell.num_docs_links, 1);
    }

    #[test]
    fn window_folds_neighboring_tiles() {
        // Two docs one tile apart; width 2 means the western cell's window
        // covers both.
        let p = params(1.0, 2);
        let mut table = table_with(vec![
            training_doc("w", 10.5, 10.5, Some(2)),
            training_doc("e", 10.5, 11.5, Some(7)),
        ]);
        let bg = {
            let mut bg = GlobalUnigram::new();
            bg.add(0, 1);
            bg.add(1, 1);
            bg
        };
        for (i, w) in [(0u32, 0u32), (1, 1)] {
            let mut m = SmoothedUnigram::new();
            m.add_count(w, 1);
            m.finish(1, &bg);
            table.set_model(i, m);
        }

        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        b.add_document(1, table.doc(1).coord.unwrap());
        let grid = b.build(&table, &bg, 1, true);

        assert_eq!(grid.num_cells(), 2);
        let west = grid.cell(grid.cell_at_corner(Tile { lat: 10, lon: 10 }).unwrap());
        assert_eq!(west.num_docs_dist, 2, "window absorbs the eastern tile");
        assert!(west.model.seen(0) && west.model.seen(1));
        // The eastern cell's window reaches further east only.
        let east = grid.cell(grid.cell_at_corner(Tile { lat: 10, lon: 11 }).unwrap());
        assert_eq!(east.num_docs_dist, 1);
    }

    #[test]
    fn links_fold_for_all_splits_but_counts_for_training_only() {
        let p = params(1.0, 1);
        let mut test_doc = training_doc("t", 5.5, 5.5, Some(50));
        test_doc.split = Split::Test;
        let table = table_with(vec![training_doc("a", 5.5, 5.5, Some(10)), test_doc]);
        let bg = GlobalUnigram::new();

        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        b.add_document(1, table.doc(1).coord.unwrap());
        let grid = b.build(&table, &bg, 1, true);

        let cell = grid.cell(grid.cell_for_coord(Coord::new(5.5, 5.5).unwrap()).unwrap());
        assert_eq!(cell.num_docs_links, 2);
        assert_eq!(cell.num_docs_dist, 0, "no finished training model was set");
        assert_eq!(cell.incoming_links_sum, 60);
        assert!(cell.num_docs_dist <= cell.num_docs_links);
        // The test-split landmark outranks the training one for popularity.
        assert_eq!(cell.most_popular_doc, Some((1, 50)));
    }

    #[test]
    fn link_prior_can_be_restricted_to_training() {
        let p = params(1.0, 1);
        let mut test_doc = training_doc("t", 5.5, 5.5, Some(50));
        test_doc.split = Split::Test;
        let table = table_with(vec![training_doc("a", 5.5, 5.5, Some(10)), test_doc]);
        let bg = GlobalUnigram::new();

        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        b.add_document(1, table.doc(1).coord.unwrap());
        let grid = b.build(&table, &bg, 1, false);

        let cell = grid.cell(grid.cell_for_coord(Coord::new(5.5, 5.5).unwrap()).unwrap());
        assert_eq!(cell.num_docs_links, 1);
        assert_eq!(cell.incoming_links_sum, 10);
    }

    #[test]
    fn most_popular_ties_go_to_first_seen() {
        let p = params(1.0, 1);
        let table = table_with(vec![
            training_doc("first", 0.5, 0.5, Some(9)),
            training_doc("second", 0.5, 0.5, Some(9)),
        ]);
        let bg = GlobalUnigram::new();
        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        b.add_document(1, table.doc(1).coord.unwrap());
        let grid = b.build(&table, &bg, 1, true);
        let cell = grid.iter_nonempty(false).next().unwrap();
        assert_eq!(cell.most_popular_doc, Some((0, 9)));
    }

    #[test]
    fn nonempty_model_iteration_skips_tokenless_cells() {
        let p = params(1.0, 1);
        let mut doc = training_doc("no-counts", 0.5, 0.5, Some(1));
        doc.split = Split::Test;
        let table = table_with(vec![doc]);
        let bg = GlobalUnigram::new();
        let mut b = GridBuilder::new(p);
        b.add_document(0, table.doc(0).coord.unwrap());
        let grid = b.build(&table, &bg, 1, true);

        assert_eq!(grid.iter_nonempty(false).count(), 1);
        assert_eq!(grid.iter_nonempty(true).count(), 0);
        assert_eq!(grid.num_empty_models(), 1);
    }

    #[test]
    fn cell_center_is_window_midpoint() {
        let p = params(2.0, 2);
        let c = p.cell_center(Tile { lat: 10, lon: 20 });
        assert!((c.lat() - 22.0).abs() < 1e-9);
        assert!((c.lon() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn cell_corners_trace_the_window() {
        let p = params(2.0, 2);
        let [sw, se, ne, nw] = p.cell_corners(Tile { lat: 10, lon: 20 });
        assert_eq!((sw.lat(), sw.lon()), (20.0, 40.0));
        assert_eq!((se.lat(), se.lon()), (20.0, 44.0));
        assert_eq!((ne.lat(), ne.lon()), (24.0, 44.0));
        assert_eq!((nw.lat(), nw.lon()), (24.0, 40.0));
    }
}
