//! Wall detection from RF attenuation, and room clustering/doorway
//! inference from wall geometry and observed motion traces.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Minimum excess attenuation, in dB, for a link to imply a wall.
pub const WALL_ATTENUATION_THRESHOLD_DB: f64 = 3.0;
/// Wall segment half-length per dB of excess attenuation, in meters.
pub const WALL_LENGTH_PER_DB: f64 = 0.15;
/// Minimum zone-transition traversals before a doorway connection is added.
pub const DOORWAY_TRAVERSAL_THRESHOLD: u32 = 3;

/// An inferred wall: a start/end point pair, its excess attenuation, and
/// the material bucket that attenuation implies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallSegment {
    pub start: (f64, f64),
    pub end: (f64, f64),
    pub attenuation_db: f64,
    pub material: Material,
}

/// Fixed attenuation-threshold material classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    Open,
    Drywall,
    Wood,
    Brick,
    Concrete,
}

impl Material {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Drywall => "drywall",
            Self::Wood => "wood",
            Self::Brick => "brick",
            Self::Concrete => "concrete",
        }
    }
}

/// Classifies a wall's material from its excess attenuation in dB.
#[must_use]
pub fn classify_material(attenuation_db: f64) -> Material {
    if attenuation_db < 3.0 {
        Material::Open
    } else if attenuation_db < 5.0 {
        Material::Drywall
    } else if attenuation_db < 8.0 {
        Material::Wood
    } else if attenuation_db < 12.0 {
        Material::Brick
    } else {
        Material::Concrete
    }
}

/// Places a perpendicular wall segment at the midpoint of every link whose
/// attenuation clears [`WALL_ATTENUATION_THRESHOLD_DB`]; segment length
/// scales with attenuation.
#[must_use]
pub fn detect_walls(
    node_positions: &BTreeMap<String, (f64, f64)>,
    link_attenuations: &BTreeMap<(String, String), f64>,
) -> Vec<WallSegment> {
    let mut walls = Vec::new();
    for ((id_a, id_b), &att_db) in link_attenuations {
        if att_db < WALL_ATTENUATION_THRESHOLD_DB {
            continue;
        }
        let (Some(&pa), Some(&pb)) = (node_positions.get(id_a), node_positions.get(id_b)) else {
            continue;
        };
        let midpoint = ((pa.0 + pb.0) / 2.0, (pa.1 + pb.1) / 2.0);
        let direction = (pb.0 - pa.0, pb.1 - pa.1);
        let link_len = (direction.0 * direction.0 + direction.1 * direction.1).sqrt();
        if link_len < 1e-12 {
            continue;
        }
        let perp = (-direction.1 / link_len, direction.0 / link_len);
        let half_len = att_db * WALL_LENGTH_PER_DB;
        let start = (midpoint.0 - perp.0 * half_len, midpoint.1 - perp.1 * half_len);
        let end = (midpoint.0 + perp.0 * half_len, midpoint.1 + perp.1 * half_len);
        walls.push(WallSegment {
            start,
            end,
            attenuation_db: att_db,
            material: classify_material(att_db),
        });
    }
    walls
}

/// A symbolic cluster of co-located nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    pub center: Option<(f64, f64)>,
    pub node_ids: Vec<String>,
}

/// An undirected link between two rooms, with an optional doorway midpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub room_a: String,
    pub room_b: String,
    pub doorway_position: Option<(f64, f64)>,
}

/// A floor plan's symbolic room layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomGraph {
    pub rooms: Vec<Room>,
    pub connections: Vec<Connection>,
}

fn segments_intersect(p1: (f64, f64), p2: (f64, f64), p3: (f64, f64), p4: (f64, f64)) -> bool {
    let d1 = (p2.0 - p1.0, p2.1 - p1.1);
    let d2 = (p4.0 - p3.0, p4.1 - p3.1);
    let cross = d1.0 * d2.1 - d1.1 * d2.0;
    if cross.abs() < 1e-12 {
        return false;
    }
    let t = ((p3.0 - p1.0) * d2.1 - (p3.1 - p1.1) * d2.0) / cross;
    let u = ((p3.0 - p1.0) * d1.1 - (p3.1 - p1.1) * d1.0) / cross;
    (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u)
}

fn wall_between(pos_a: (f64, f64), pos_b: (f64, f64), walls: &[WallSegment]) -> bool {
    walls.iter().any(|w| segments_intersect(pos_a, pos_b, w.start, w.end))
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, x: usize, y: usize) {
        let (rx, ry) = (self.find(x), self.find(y));
        if rx != ry {
            self.parent[rx] = ry;
        }
    }
}

/// Clusters nodes into rooms: two nodes join the same room iff no wall
/// segment intersects the line between them. Infers one doorway connection
/// per pair of adjacent rooms, at the closest cross-room node pair.
#[must_use]
pub fn infer_rooms_from_nodes(
    node_positions: &BTreeMap<String, (f64, f64)>,
    wall_segments: &[WallSegment],
) -> RoomGraph {
    let node_ids: Vec<&String> = node_positions.keys().collect();
    let n = node_ids.len();
    if n == 0 {
        return RoomGraph::default();
    }

    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let pos_i = node_positions[node_ids[i]];
            let pos_j = node_positions[node_ids[j]];
            if !wall_between(pos_i, pos_j, wall_segments) {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }

    let mut rooms = Vec::new();
    for (idx, members) in clusters.values().enumerate() {
        let member_ids: Vec<String> = members.iter().map(|&i| node_ids[i].clone()).collect();
        let (sx, sy) = members.iter().fold((0.0, 0.0), |(sx, sy), &i| {
            let p = node_positions[node_ids[i]];
            (sx + p.0, sy + p.1)
        });
        let count = members.len() as f64;
        rooms.push(Room {
            name: format!("room_{idx}"),
            center: Some((sx / count, sy / count)),
            node_ids: member_ids,
        });
    }

    let mut room_of_node: HashMap<&str, &str> = HashMap::new();
    for room in &rooms {
        for nid in &room.node_ids {
            room_of_node.insert(nid.as_str(), room.name.as_str());
        }
    }

    let mut best_pair: BTreeMap<(String, String), (f64, usize, usize)> = BTreeMap::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let ra = room_of_node[node_ids[i].as_str()];
            let rb = room_of_node[node_ids[j].as_str()];
            if ra == rb {
                continue;
            }
            let pair = if ra < rb {
                (ra.to_string(), rb.to_string())
            } else {
                (rb.to_string(), ra.to_string())
            };
            let pa = node_positions[node_ids[i]];
            let pb = node_positions[node_ids[j]];
            let dist = ((pa.0 - pb.0).powi(2) + (pa.1 - pb.1).powi(2)).sqrt();
            best_pair
                .entry(pair)
                .and_modify(|entry| {
                    if dist < entry.0 {
                        *entry = (dist, i, j);
                    }
                })
                .or_insert((dist, i, j));
        }
    }

    let mut connections = Vec::new();
    for ((room_a, room_b), (_, i, j)) in best_pair {
        let pa = node_positions[node_ids[i]];
        let pb = node_positions[node_ids[j]];
        let midpoint = ((pa.0 + pb.0) / 2.0, (pa.1 + pb.1) / 2.0);
        connections.push(Connection {
            room_a,
            room_b,
            doorway_position: Some(midpoint),
        });
    }

    RoomGraph { rooms, connections }
}

/// Adds a doorway connection for every zone pair traversed at least
/// [`DOORWAY_TRAVERSAL_THRESHOLD`] times, as long as both zones are known
/// rooms and the pair isn't already connected.
#[must_use]
pub fn update_topology(graph: &RoomGraph, motion_events: &[(String, String, f64)]) -> RoomGraph {
    let mut traversal_counts: BTreeMap<(String, String), u32> = BTreeMap::new();
    for (from_zone, to_zone, _ts) in motion_events {
        if from_zone == to_zone {
            continue;
        }
        let pair = if from_zone < to_zone {
            (from_zone.clone(), to_zone.clone())
        } else {
            (to_zone.clone(), from_zone.clone())
        };
        *traversal_counts.entry(pair).or_insert(0) += 1;
    }

    let mut existing: BTreeSet<(String, String)> = graph
        .connections
        .iter()
        .map(|c| {
            if c.room_a < c.room_b {
                (c.room_a.clone(), c.room_b.clone())
            } else {
                (c.room_b.clone(), c.room_a.clone())
            }
        })
        .collect();

    let room_names: BTreeSet<&str> = graph.rooms.iter().map(|r| r.name.as_str()).collect();

    let mut connections = graph.connections.clone();
    for (pair, count) in traversal_counts {
        if count < DOORWAY_TRAVERSAL_THRESHOLD || existing.contains(&pair) {
            continue;
        }
        if !room_names.contains(pair.0.as_str()) || !room_names.contains(pair.1.as_str()) {
            continue;
        }
        connections.push(Connection {
            room_a: pair.0.clone(),
            room_b: pair.1.clone(),
            doorway_position: None,
        });
        existing.insert(pair);
    }

    RoomGraph { rooms: graph.rooms.clone(), connections }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_material_thresholds() {
        assert_eq!(classify_material(1.0), Material::Open);
        assert_eq!(classify_material(4.0), Material::Drywall);
        assert_eq!(classify_material(7.0), Material::Wood);
        assert_eq!(classify_material(10.0), Material::Brick);
        assert_eq!(classify_material(15.0), Material::Concrete);
    }

    #[test]
    fn detects_a_wall_perpendicular_to_a_strongly_attenuated_link() {
        let mut positions = BTreeMap::new();
        positions.insert("a".to_string(), (0.0, 0.0));
        positions.insert("b".to_string(), (4.0, 0.0));
        let mut attenuations = BTreeMap::new();
        attenuations.insert(("a".to_string(), "b".to_string()), 6.0);

        let walls = detect_walls(&positions, &attenuations);
        assert_eq!(walls.len(), 1);
        let wall = &walls[0];
        assert_eq!(wall.material, Material::Wood);
        assert!((wall.start.0 - 2.0).abs() < 1e-9);
        assert!((wall.end.0 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn weak_links_produce_no_wall() {
        let mut positions = BTreeMap::new();
        positions.insert("a".to_string(), (0.0, 0.0));
        positions.insert("b".to_string(), (4.0, 0.0));
        let mut attenuations = BTreeMap::new();
        attenuations.insert(("a".to_string(), "b".to_string()), 1.0);
        assert!(detect_walls(&positions, &attenuations).is_empty());
    }

    #[test]
    fn a_wall_between_two_nodes_splits_them_into_separate_rooms() {
        let mut positions = BTreeMap::new();
        positions.insert("a".to_string(), (0.0, 0.0));
        positions.insert("b".to_string(), (4.0, 0.0));
        let walls = vec![WallSegment {
            start: (2.0, -2.0),
            end: (2.0, 2.0),
            attenuation_db: 6.0,
            material: Material::Wood,
        }];
        let graph = infer_rooms_from_nodes(&positions, &walls);
        assert_eq!(graph.rooms.len(), 2);
        assert_eq!(graph.connections.len(), 1);
    }

    #[test]
    fn no_walls_means_a_single_room() {
        let mut positions = BTreeMap::new();
        positions.insert("a".to_string(), (0.0, 0.0));
        positions.insert("b".to_string(), (1.0, 0.0));
        let graph = infer_rooms_from_nodes(&positions, &[]);
        assert_eq!(graph.rooms.len(), 1);
    }

    #[test]
    fn frequent_traversals_add_a_doorway_connection() {
        let graph = RoomGraph {
            rooms: vec![
                Room { name: "room_0".into(), center: None, node_ids: vec![] },
                Room { name: "room_1".into(), center: None, node_ids: vec![] },
            ],
            connections: vec![],
        };
        let events = vec![
            ("room_0".to_string(), "room_1".to_string(), 1.0),
            ("room_0".to_string(), "room_1".to_string(), 2.0),
            ("room_1".to_string(), "room_0".to_string(), 3.0),
        ];
        let updated = update_topology(&graph, &events);
        assert_eq!(updated.connections.len(), 1);
    }

    #[test]
    fn infrequent_traversals_do_not_add_a_doorway() {
        let graph = RoomGraph {
            rooms: vec![
                Room { name: "room_0".into(), center: None, node_ids: vec![] },
                Room { name: "room_1".into(), center: None, node_ids: vec![] },
            ],
            connections: vec![],
        };
        let events = vec![("room_0".to_string(), "room_1".to_string(), 1.0)];
        let updated = update_topology(&graph, &events);
        assert!(updated.connections.is_empty());
    }
}
