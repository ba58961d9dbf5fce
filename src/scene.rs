//! Scene import and mesh ingestion.
//!
//! [`import_scene`] parses a glTF 2.0 file into a [`Scene`]: a node tree
//! whose nodes reference entries of a shared mesh array. Import-time
//! post-processing guarantees triangle faces and fills in smooth normals
//! where the source has none.
//!
//! [`flatten`] then walks the tree in pre-order and turns every referenced
//! mesh into a plain [`Mesh`] with the fixed [`Vertex`] layout.

use std::path::Path;

use glam::Vec3;
use tracing::{debug, info, warn};

use crate::error::RenderError;
use crate::mesh::{Mesh, Vertex};

/// One node of the scene tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneNode {
    pub name: String,
    /// Indices into [`Scene::meshes`].
    pub meshes: Vec<usize>,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_meshes(mut self, meshes: impl IntoIterator<Item = usize>) -> Self {
        self.meshes.extend(meshes);
        self
    }

    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.push(child);
        self
    }
}

/// Imported mesh data. Channels that the source file lacks are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneMesh {
    pub vertex_count: usize,
    pub positions: Option<Vec<[f32; 3]>>,
    pub normals: Option<Vec<[f32; 3]>>,
    /// First texture coordinate set.
    pub tex_coords: Option<Vec<[f32; 2]>>,
    /// Vertex indices per face.
    pub faces: Vec<Vec<u32>>,
}

/// An imported scene: a node tree plus the mesh array its nodes point into.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scene {
    pub root: SceneNode,
    pub meshes: Vec<SceneMesh>,
    pub material_count: usize,
}

impl Scene {
    /// Number of mesh references reached by a pre-order walk from the root.
    ///
    /// A mesh referenced by two nodes counts twice.
    pub fn reachable_mesh_count(&self) -> usize {
        fn count(node: &SceneNode) -> usize {
            node.meshes.len() + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    /// Number of faces over every reachable mesh reference.
    pub fn face_count(&self) -> usize {
        fn count(scene: &Scene, node: &SceneNode) -> usize {
            let own: usize = node
                .meshes
                .iter()
                .filter_map(|&i| scene.meshes.get(i))
                .map(|m| m.faces.len())
                .sum();
            own + node.children.iter().map(|c| count(scene, c)).sum::<usize>()
        }
        count(self, &self.root)
    }
}

/// Flattens a scene tree into plain meshes.
///
/// Meshes referenced by a node come before those of its children; children
/// are visited in order. Missing channels default to zero vectors.
///
/// # Panics
///
/// Panics if a face is not a triangle, or a node references a mesh index
/// outside [`Scene::meshes`]. Triangulation is the importer's job.
pub fn flatten(scene: &Scene) -> Vec<Mesh> {
    let mut out = Vec::with_capacity(scene.reachable_mesh_count());
    flatten_node(scene, &scene.root, &mut out);
    out
}

fn flatten_node(scene: &Scene, node: &SceneNode, out: &mut Vec<Mesh>) {
    for &index in &node.meshes {
        let source = &scene.meshes[index];
        out.push(convert_mesh(source));
    }
    for child in &node.children {
        flatten_node(scene, child, out);
    }
}

fn convert_mesh(source: &SceneMesh) -> Mesh {
    let channel3 = |channel: &Option<Vec<[f32; 3]>>, i: usize| {
        channel
            .as_ref()
            .and_then(|values| values.get(i).copied())
            .unwrap_or_default()
    };

    let vertices = (0..source.vertex_count)
        .map(|i| Vertex {
            position: channel3(&source.positions, i),
            normal: channel3(&source.normals, i),
            tex_coord: source
                .tex_coords
                .as_ref()
                .and_then(|uvs| uvs.get(i).copied())
                .unwrap_or_default(),
        })
        .collect();

    let mut indices = Vec::with_capacity(source.faces.len() * 3);
    for face in &source.faces {
        assert!(
            face.len() == 3,
            "face with {} indices reached ingestion; faces must be triangulated on import",
            face.len()
        );
        indices.extend_from_slice(face);
    }

    Mesh::new(vertices, indices)
}

/// Imports a glTF 2.0 file (`.gltf` or `.glb`).
///
/// The returned root is a synthetic node whose children are the root nodes
/// of the file's default scene (or its first scene). Each glTF primitive
/// becomes its own [`SceneMesh`].
pub fn import_scene(path: &Path) -> Result<Scene, RenderError> {
    if !path.exists() {
        return Err(RenderError::AssetNotFound(path.to_path_buf()));
    }

    let (document, buffers, _images) = gltf::import(path).map_err(|e| {
        RenderError::SceneImportError {
            message: format!("{}: {}", path.display(), e),
        }
    })?;

    // glTF mesh index -> scene mesh indices (one per primitive)
    let mut primitive_map: Vec<Vec<usize>> = Vec::with_capacity(document.meshes().len());
    let mut meshes = Vec::new();

    for mesh in document.meshes() {
        let name = mesh.name().unwrap_or("unnamed");
        let mut indices = Vec::new();

        for primitive in mesh.primitives() {
            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

            let positions: Option<Vec<[f32; 3]>> = reader.read_positions().map(|p| p.collect());
            let normals: Option<Vec<[f32; 3]>> = reader.read_normals().map(|n| n.collect());
            let tex_coords: Option<Vec<[f32; 2]>> =
                reader.read_tex_coords(0).map(|tc| tc.into_f32().collect());

            let vertex_count = positions.as_ref().map_or(0, Vec::len);
            let source_indices: Vec<u32> = match reader.read_indices() {
                Some(idx) => idx.into_u32().collect(),
                None => (0..vertex_count as u32).collect(),
            };

            let faces = triangulate(primitive.mode(), &source_indices).map_err(|message| {
                RenderError::SceneImportError {
                    message: format!("mesh '{}' primitive {}: {}", name, primitive.index(), message),
                }
            })?;

            let normals = match normals {
                Some(n) => Some(n),
                None => positions.as_ref().map(|p| smooth_normals(p, &faces)),
            };

            indices.push(meshes.len());
            meshes.push(SceneMesh {
                vertex_count,
                positions,
                normals,
                tex_coords,
                faces,
            });
        }

        debug!("imported mesh '{}' with {} primitives", name, indices.len());
        primitive_map.push(indices);
    }

    let mut root = SceneNode::new("root");
    match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => {
            for node in scene.nodes() {
                root.children.push(convert_node(&node, &primitive_map));
            }
        }
        None => {
            warn!(
                "'{}' declares no scene; attaching every mesh to the root",
                path.display()
            );
            root.meshes = (0..meshes.len()).collect();
        }
    }

    let scene = Scene {
        root,
        meshes,
        material_count: document.materials().len(),
    };

    info!(
        "imported scene '{}': {} meshes, {} faces, {} materials",
        path.display(),
        scene.meshes.len(),
        scene.face_count(),
        scene.material_count
    );
    Ok(scene)
}

fn convert_node(node: &gltf::Node<'_>, primitive_map: &[Vec<usize>]) -> SceneNode {
    let mut out = SceneNode::new(node.name().unwrap_or(""));
    if let Some(mesh) = node.mesh() {
        out.meshes.extend_from_slice(&primitive_map[mesh.index()]);
    }
    for child in node.children() {
        out.children.push(convert_node(&child, primitive_map));
    }
    out
}

/// Converts a primitive's index stream into triangle faces.
fn triangulate(mode: gltf::mesh::Mode, indices: &[u32]) -> Result<Vec<Vec<u32>>, String> {
    use gltf::mesh::Mode;

    let faces = match mode {
        Mode::Triangles => {
            if indices.len() % 3 != 0 {
                warn!(
                    "triangle list has {} trailing indices, ignoring them",
                    indices.len() % 3
                );
            }
            indices.chunks_exact(3).map(<[u32]>::to_vec).collect()
        }
        Mode::TriangleStrip => indices
            .windows(3)
            .enumerate()
            .map(|(i, w)| {
                // keep winding consistent on odd triangles
                if i % 2 == 0 {
                    vec![w[0], w[1], w[2]]
                } else {
                    vec![w[1], w[0], w[2]]
                }
            })
            .collect(),
        Mode::TriangleFan => match indices.split_first() {
            Some((&hub, rest)) => rest.windows(2).map(|w| vec![hub, w[0], w[1]]).collect(),
            None => Vec::new(),
        },
        other => return Err(format!("unsupported primitive mode {other:?}")),
    };
    Ok(faces)
}

/// Area-weighted smooth vertex normals.
fn smooth_normals(positions: &[[f32; 3]], faces: &[Vec<u32>]) -> Vec<[f32; 3]> {
    let mut accum = vec![Vec3::ZERO; positions.len()];
    for face in faces {
        let [a, b, c] = [face[0], face[1], face[2]].map(|i| i as usize);
        let (Some(pa), Some(pb), Some(pc)) = (positions.get(a), positions.get(b), positions.get(c))
        else {
            continue;
        };
        let (pa, pb, pc) = (Vec3::from(*pa), Vec3::from(*pb), Vec3::from(*pc));
        // Cross product length is twice the triangle area.
        let n = (pb - pa).cross(pc - pa);
        accum[a] += n;
        accum[b] += n;
        accum[c] += n;
    }
    accum
        .into_iter()
        .map(|n| n.normalize_or_zero().to_array())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn triangle_mesh(offset: f32) -> SceneMesh {
        SceneMesh {
            vertex_count: 3,
            positions: Some(vec![[offset, 0.0, 0.0], [offset + 1.0, 0.0, 0.0], [offset, 1.0, 0.0]]),
            normals: Some(vec![[0.0, 0.0, 1.0]; 3]),
            tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]),
            faces: vec![vec![0, 1, 2]],
        }
    }

    fn two_level_scene() -> Scene {
        Scene {
            root: SceneNode::new("root")
                .with_meshes([2])
                .with_child(SceneNode::new("a").with_meshes([0]).with_child(
                    SceneNode::new("a.1").with_meshes([1, 0]),
                ))
                .with_child(SceneNode::new("b").with_meshes([1])),
            meshes: vec![triangle_mesh(0.0), triangle_mesh(10.0), triangle_mesh(20.0)],
            material_count: 0,
        }
    }

    #[test]
    fn flatten_visits_nodes_in_pre_order() {
        let scene = two_level_scene();
        let meshes = flatten(&scene);

        let origins: Vec<f32> = meshes.iter().map(|m| m.vertices[0].position[0]).collect();
        assert_eq!(origins, vec![20.0, 0.0, 10.0, 0.0, 10.0]);
    }

    #[test]
    fn flatten_counts_match_scene() {
        let scene = two_level_scene();
        let meshes = flatten(&scene);

        assert_eq!(meshes.len(), scene.reachable_mesh_count());
        let total_indices: usize = meshes.iter().map(|m| m.indices.len()).sum();
        assert_eq!(total_indices, 3 * scene.face_count());
    }

    #[test]
    fn missing_channels_default_to_zero() {
        let scene = Scene {
            root: SceneNode::new("root").with_meshes([0]),
            meshes: vec![SceneMesh {
                vertex_count: 3,
                positions: None,
                normals: None,
                tex_coords: None,
                faces: vec![vec![0, 1, 2]],
            }],
            material_count: 0,
        };

        let meshes = flatten(&scene);
        assert_eq!(meshes[0].vertices, vec![Vertex::default(); 3]);
        assert_eq!(meshes[0].indices, vec![0, 1, 2]);
    }

    #[test]
    fn empty_scene_flattens_to_nothing() {
        assert!(flatten(&Scene::default()).is_empty());
    }

    #[test]
    #[should_panic(expected = "must be triangulated")]
    fn non_triangle_face_is_a_contract_breach() {
        let mut mesh = triangle_mesh(0.0);
        mesh.vertex_count = 4;
        mesh.faces = vec![vec![0, 1, 2, 3]];
        let scene = Scene {
            root: SceneNode::new("root").with_meshes([0]),
            meshes: vec![mesh],
            material_count: 0,
        };
        flatten(&scene);
    }

    #[test]
    fn strips_and_fans_become_triangle_lists() {
        use gltf::mesh::Mode;

        let strip = triangulate(Mode::TriangleStrip, &[0, 1, 2, 3]).unwrap();
        assert_eq!(strip, vec![vec![0, 1, 2], vec![2, 1, 3]]);

        let fan = triangulate(Mode::TriangleFan, &[0, 1, 2, 3]).unwrap();
        assert_eq!(fan, vec![vec![0, 1, 2], vec![0, 2, 3]]);

        assert!(triangulate(Mode::Lines, &[0, 1]).is_err());
        assert!(triangulate(Mode::Points, &[0]).is_err());
    }

    #[test]
    fn generated_normals_face_the_winding() {
        let normals = smooth_normals(
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [5.0, 5.0, 5.0]],
            &[vec![0, 1, 2]],
        );
        assert_eq!(normals[0], [0.0, 0.0, 1.0]);
        assert_eq!(normals[2], [0.0, 0.0, 1.0]);
        // unreferenced vertex
        assert_eq!(normals[3], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn import_missing_file_is_not_found() {
        let err = import_scene(Path::new("/nonexistent/scene.glb")).unwrap_err();
        assert!(matches!(err, RenderError::AssetNotFound(_)));
    }

    #[test]
    fn import_garbage_is_an_import_error() {
        let mut file = tempfile::Builder::new().suffix(".gltf").tempfile().unwrap();
        file.write_all(b"{ this is not gltf").unwrap();

        let err = import_scene(file.path()).unwrap_err();
        assert!(matches!(err, RenderError::SceneImportError { .. }));
    }

    // A unit quad stored as a non-indexed triangle fan without normals,
    // referenced by a parent node and its child.
    const FAN_QUAD_GLTF: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [ { "nodes": [0] } ],
        "nodes": [
            { "name": "parent", "mesh": 0, "children": [1] },
            { "name": "child", "mesh": 0 }
        ],
        "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 }, "mode": 6 } ] } ],
        "accessors": [ {
            "bufferView": 0, "componentType": 5126, "count": 4, "type": "VEC3",
            "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
        } ],
        "bufferViews": [ { "buffer": 0, "byteLength": 48 } ],
        "buffers": [ {
            "byteLength": 48,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAACAPwAAgD8AAAAAAAAAAAAAgD8AAAAA"
        } ]
    }"#;

    #[test]
    fn import_triangulates_and_generates_normals() {
        let mut file = tempfile::Builder::new().suffix(".gltf").tempfile().unwrap();
        file.write_all(FAN_QUAD_GLTF.as_bytes()).unwrap();

        let scene = import_scene(file.path()).unwrap();

        assert_eq!(scene.meshes.len(), 1);
        assert_eq!(scene.root.children.len(), 1);
        assert_eq!(scene.root.children[0].name, "parent");
        assert_eq!(scene.root.children[0].children[0].name, "child");
        assert_eq!(scene.reachable_mesh_count(), 2);

        let meshes = flatten(&scene);
        assert_eq!(meshes.len(), 2);
        assert_eq!(meshes[0].indices, vec![0, 1, 2, 0, 2, 3]);
        assert!(meshes[0].vertices.iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
        assert!(meshes[0].vertices.iter().all(|v| v.tex_coord == [0.0, 0.0]));
    }
}
