//! 2-D collision space: a spatial hash over convex polygons and circles
//! with overlap queries that yield a separation depth and direction.
//!
//! All queries are deterministic: cells enumerate colliders in key order
//! and the separating-axis scan walks axes in a fixed order.

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn dot(self, rhs: Vec2) -> f64 {
        self.x * rhs.x + self.y * rhs.y
    }

    fn len(self) -> f64 {
        self.dot(self).sqrt()
    }
}

/// Shape geometry relative to the collider anchor. Polygon points must be
/// convex and wound consistently; a circle occupies the AABB
/// `[x, x+2r] × [y, y+2r]` like a rect of the same size.
#[derive(Clone, Debug)]
pub enum ColliderShape {
    Polygon { points: Vec<Vec2> },
    Circle { radius: f64 },
}

/// What a collider stands for; carried opaquely and matched by phase logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColliderTag {
    Player(i32),
    Barrier(i32),
    Bullet(i32),
}

#[derive(Clone, Debug)]
pub struct Collider {
    pub x: f64,
    pub y: f64,
    pub shape: ColliderShape,
    pub tag: ColliderTag,
}

impl Collider {
    /// Axis-aligned rectangle with its anchor at the bottom-left corner.
    pub fn rect(x: f64, y: f64, w: f64, h: f64, tag: ColliderTag) -> Self {
        Self {
            x,
            y,
            shape: ColliderShape::Polygon {
                points: vec![
                    Vec2::new(0.0, 0.0),
                    Vec2::new(w, 0.0),
                    Vec2::new(w, h),
                    Vec2::new(0.0, h),
                ],
            },
            tag,
        }
    }

    pub fn polygon(x: f64, y: f64, points: Vec<Vec2>, tag: ColliderTag) -> Self {
        Self {
            x,
            y,
            shape: ColliderShape::Polygon { points },
            tag,
        }
    }

    pub fn circle(x: f64, y: f64, radius: f64, tag: ColliderTag) -> Self {
        Self {
            x,
            y,
            shape: ColliderShape::Circle { radius },
            tag,
        }
    }

    fn aabb(&self) -> (f64, f64, f64, f64) {
        match &self.shape {
            ColliderShape::Polygon { points } => {
                let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
                let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
                for p in points {
                    min_x = min_x.min(p.x);
                    min_y = min_y.min(p.y);
                    max_x = max_x.max(p.x);
                    max_y = max_y.max(p.y);
                }
                (
                    self.x + min_x,
                    self.y + min_y,
                    self.x + max_x,
                    self.y + max_y,
                )
            },
            ColliderShape::Circle { radius } => (
                self.x,
                self.y,
                self.x + 2.0 * radius,
                self.y + 2.0 * radius,
            ),
        }
    }

    fn world_points(&self) -> Vec<Vec2> {
        match &self.shape {
            ColliderShape::Polygon { points } => points
                .iter()
                .map(|p| Vec2::new(self.x + p.x, self.y + p.y))
                .collect(),
            ColliderShape::Circle { .. } => Vec::new(),
        }
    }

    fn center(&self) -> Vec2 {
        let (min_x, min_y, max_x, max_y) = self.aabb();
        Vec2::new((min_x + max_x) * 0.5, (min_y + max_y) * 0.5)
    }
}

/// Result of an overlap test between colliders `a` and `b`: `(nx, ny)` is
/// the unit direction from `a` toward `b` along the axis of least
/// penetration, so moving `a` by `-depth·(nx, ny)` separates the pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Overlap {
    pub depth: f64,
    pub nx: f64,
    pub ny: f64,
}

impl Overlap {
    /// The world-space vector to subtract from `a`'s position.
    pub fn pushback(&self) -> (f64, f64) {
        (self.depth * self.nx, self.depth * self.ny)
    }
}

pub type ColliderKey = usize;

pub struct CollisionSpace {
    width: f64,
    height: f64,
    cell_w: f64,
    cell_h: f64,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<ColliderKey>>,
    colliders: Vec<Option<Collider>>,
    free_keys: Vec<ColliderKey>,
}

impl CollisionSpace {
    pub fn new(discrete_w: i32, discrete_h: i32, tile_w: i32, tile_h: i32) -> Self {
        let cols = discrete_w.max(1) as usize;
        let rows = discrete_h.max(1) as usize;
        Self {
            width: f64::from(discrete_w * tile_w),
            height: f64::from(discrete_h * tile_h),
            cell_w: f64::from(tile_w),
            cell_h: f64::from(tile_h),
            cols,
            rows,
            cells: vec![Vec::new(); cols * rows],
            colliders: Vec::new(),
            free_keys: Vec::new(),
        }
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn add(&mut self, collider: Collider) -> ColliderKey {
        let key = match self.free_keys.pop() {
            Some(k) => {
                self.colliders[k] = Some(collider);
                k
            },
            None => {
                self.colliders.push(Some(collider));
                self.colliders.len() - 1
            },
        };
        self.insert_into_cells(key);
        key
    }

    pub fn remove(&mut self, key: ColliderKey) -> Option<Collider> {
        self.colliders.get(key)?.as_ref()?;
        self.remove_from_cells(key);
        let collider = self.colliders[key].take();
        self.free_keys.push(key);
        collider
    }

    pub fn get(&self, key: ColliderKey) -> Option<&Collider> {
        self.colliders.get(key)?.as_ref()
    }

    pub fn position(&self, key: ColliderKey) -> (f64, f64) {
        match self.get(key) {
            Some(c) => (c.x, c.y),
            None => (0.0, 0.0),
        }
    }

    /// Move a collider and re-bucket it.
    pub fn set_position(&mut self, key: ColliderKey, x: f64, y: f64) {
        if self.colliders.get(key).map(Option::is_none).unwrap_or(true) {
            return;
        }
        self.remove_from_cells(key);
        if let Some(c) = self.colliders[key].as_mut() {
            c.x = x;
            c.y = y;
        }
        self.insert_into_cells(key);
    }

    /// Keys of every other collider sharing a cell with `key`'s AABB,
    /// deduplicated and in ascending key order.
    pub fn potentials(&self, key: ColliderKey) -> Vec<ColliderKey> {
        let Some(collider) = self.get(key) else {
            return Vec::new();
        };
        let (c0, r0, c1, r1) = self.cell_range(collider.aabb());
        let mut found = Vec::new();
        for row in r0..=r1 {
            for col in c0..=c1 {
                for &other in &self.cells[row * self.cols + col] {
                    if other != key {
                        found.push(other);
                    }
                }
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Narrow-phase test between two stored colliders.
    pub fn check_overlap(&self, a: ColliderKey, b: ColliderKey) -> Option<Overlap> {
        let ca = self.get(a)?;
        let cb = self.get(b)?;
        overlap_colliders(ca, cb)
    }

    fn cell_range(&self, (min_x, min_y, max_x, max_y): (f64, f64, f64, f64)) -> (usize, usize, usize, usize) {
        let clamp_col = |w: f64| -> usize {
            ((w / self.cell_w).floor().max(0.0) as usize).min(self.cols - 1)
        };
        let clamp_row = |h: f64| -> usize {
            ((h / self.cell_h).floor().max(0.0) as usize).min(self.rows - 1)
        };
        (clamp_col(min_x), clamp_row(min_y), clamp_col(max_x), clamp_row(max_y))
    }

    fn insert_into_cells(&mut self, key: ColliderKey) {
        let aabb = match self.colliders[key].as_ref() {
            Some(c) => c.aabb(),
            None => return,
        };
        let (c0, r0, c1, r1) = self.cell_range(aabb);
        for row in r0..=r1 {
            for col in c0..=c1 {
                self.cells[row * self.cols + col].push(key);
            }
        }
    }

    fn remove_from_cells(&mut self, key: ColliderKey) {
        let aabb = match self.colliders[key].as_ref() {
            Some(c) => c.aabb(),
            None => return,
        };
        let (c0, r0, c1, r1) = self.cell_range(aabb);
        for row in r0..=r1 {
            for col in c0..=c1 {
                self.cells[row * self.cols + col].retain(|&k| k != key);
            }
        }
    }
}

/// Separating-axis overlap between two colliders in world space.
pub fn overlap_colliders(a: &Collider, b: &Collider) -> Option<Overlap> {
    match (&a.shape, &b.shape) {
        (ColliderShape::Circle { radius: ra }, ColliderShape::Circle { radius: rb }) => {
            let ca = Vec2::new(a.x + ra, a.y + ra);
            let cb = Vec2::new(b.x + rb, b.y + rb);
            overlap_circles(ca, *ra, cb, *rb)
        },
        (ColliderShape::Circle { radius }, ColliderShape::Polygon { .. }) => {
            let center = Vec2::new(a.x + radius, a.y + radius);
            overlap_circle_polygon(center, *radius, &b.world_points())
        },
        (ColliderShape::Polygon { .. }, ColliderShape::Circle { radius }) => {
            let center = Vec2::new(b.x + radius, b.y + radius);
            overlap_circle_polygon(center, *radius, &a.world_points()).map(|o| Overlap {
                depth: o.depth,
                nx: -o.nx,
                ny: -o.ny,
            })
        },
        (ColliderShape::Polygon { .. }, ColliderShape::Polygon { .. }) => {
            overlap_polygons(&a.world_points(), a.center(), &b.world_points(), b.center())
        },
    }
}

fn project(points: &[Vec2], axis: Vec2) -> (f64, f64) {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for p in points {
        let d = p.dot(axis);
        min = min.min(d);
        max = max.max(d);
    }
    (min, max)
}

fn edge_normals(points: &[Vec2], out: &mut Vec<Vec2>) {
    for i in 0..points.len() {
        let p0 = points[i];
        let p1 = points[(i + 1) % points.len()];
        let edge = Vec2::new(p1.x - p0.x, p1.y - p0.y);
        let len = edge.len();
        if len <= f64::EPSILON {
            continue;
        }
        out.push(Vec2::new(-edge.y / len, edge.x / len));
    }
}

fn overlap_polygons(
    pa: &[Vec2],
    center_a: Vec2,
    pb: &[Vec2],
    center_b: Vec2,
) -> Option<Overlap> {
    let mut axes = Vec::with_capacity(pa.len() + pb.len());
    edge_normals(pa, &mut axes);
    edge_normals(pb, &mut axes);

    let mut best_depth = f64::MAX;
    let mut best_axis = Vec2::new(0.0, 0.0);
    for axis in axes {
        let (min_a, max_a) = project(pa, axis);
        let (min_b, max_b) = project(pb, axis);
        let depth = max_a.min(max_b) - min_a.max(min_b);
        if depth <= 0.0 {
            return None;
        }
        if depth < best_depth {
            best_depth = depth;
            best_axis = axis;
        }
    }

    Some(orient(best_depth, best_axis, center_a, center_b))
}

fn overlap_circle_polygon(center: Vec2, radius: f64, poly: &[Vec2]) -> Option<Overlap> {
    let mut axes = Vec::with_capacity(poly.len() + 1);
    edge_normals(poly, &mut axes);

    // Axis toward the polygon vertex closest to the circle center covers
    // the corner case the edge normals miss.
    let mut closest = poly[0];
    let mut closest_d2 = f64::MAX;
    for p in poly {
        let d = Vec2::new(p.x - center.x, p.y - center.y);
        let d2 = d.dot(d);
        if d2 < closest_d2 {
            closest_d2 = d2;
            closest = *p;
        }
    }
    let to_closest = Vec2::new(closest.x - center.x, closest.y - center.y);
    let len = to_closest.len();
    if len > f64::EPSILON {
        axes.push(Vec2::new(to_closest.x / len, to_closest.y / len));
    }

    let mut best_depth = f64::MAX;
    let mut best_axis = Vec2::new(0.0, 0.0);
    for axis in axes {
        let c = center.dot(axis);
        let (min_a, max_a) = (c - radius, c + radius);
        let (min_b, max_b) = project(poly, axis);
        let depth = max_a.min(max_b) - min_a.max(min_b);
        if depth <= 0.0 {
            return None;
        }
        if depth < best_depth {
            best_depth = depth;
            best_axis = axis;
        }
    }

    let mut poly_center = Vec2::new(0.0, 0.0);
    for p in poly {
        poly_center.x += p.x;
        poly_center.y += p.y;
    }
    poly_center.x /= poly.len() as f64;
    poly_center.y /= poly.len() as f64;

    Some(orient(best_depth, best_axis, center, poly_center))
}

fn overlap_circles(ca: Vec2, ra: f64, cb: Vec2, rb: f64) -> Option<Overlap> {
    let d = Vec2::new(cb.x - ca.x, cb.y - ca.y);
    let dist = d.len();
    let depth = ra + rb - dist;
    if depth <= 0.0 {
        return None;
    }
    if dist <= f64::EPSILON {
        // Coincident centers: any direction separates.
        return Some(Overlap {
            depth,
            nx: 1.0,
            ny: 0.0,
        });
    }
    Some(Overlap {
        depth,
        nx: d.x / dist,
        ny: d.y / dist,
    })
}

fn orient(depth: f64, axis: Vec2, center_a: Vec2, center_b: Vec2) -> Overlap {
    let a_to_b = Vec2::new(center_b.x - center_a.x, center_b.y - center_a.y);
    if a_to_b.dot(axis) < 0.0 {
        Overlap {
            depth,
            nx: -axis.x,
            ny: -axis.y,
        }
    } else {
        Overlap {
            depth,
            nx: axis.x,
            ny: axis.y,
        }
    }
}
