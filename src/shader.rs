//! Precompiled shader binaries to a linked program.
//!
//! Shader stages are shipped as SPIR-V blobs. [`load_program`] reads one
//! blob per stage, hands each to the device, specializes it at the `main`
//! entry point with no specialization constants, checks compilation, and
//! links the pair into a [`Program`].
//!
//! Stage objects never outlive the call: they are released once the link
//! has consumed them, and on every failure path, including a fragment
//! failure that happens after the vertex stage already compiled.

use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, error, info};

use crate::device::{ProgramId, RenderDevice, ShaderStage, ShaderStageId};
use crate::error::RenderError;

/// Maximum number of diagnostic bytes kept from a compile or link log.
pub const MAX_INFO_LOG: usize = 512;

/// Entry point every stage is specialized at.
pub const ENTRY_POINT: &str = "main";

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A linked program object. Deleted from the device on drop.
pub struct Program<D: RenderDevice> {
    device: Rc<D>,
    id: ProgramId,
}

impl<D: RenderDevice> Program<D> {
    pub fn id(&self) -> ProgramId {
        self.id
    }
}

impl<D: RenderDevice> Drop for Program<D> {
    fn drop(&mut self) {
        self.device.delete_program(self.id);
    }
}

impl<D: RenderDevice> fmt::Debug for Program<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("id", &self.id).finish()
    }
}

/// A shader stage that is released when it goes out of scope.
struct StageGuard<'a, D: RenderDevice> {
    device: &'a D,
    stage: ShaderStage,
    id: ShaderStageId,
}

impl<'a, D: RenderDevice> StageGuard<'a, D> {
    fn compile(device: &'a D, stage: ShaderStage, binary: &[u8]) -> Result<Self, RenderError> {
        let id = device.create_shader_stage(stage, binary)?;
        let guard = Self { device, stage, id };
        device.specialize_shader(id, ENTRY_POINT, &[]);

        let status = device.shader_status(id);
        if !status.ok {
            let log = truncate_log(&status.log);
            error!("{} shader failed to compile: {}", stage, log);
            return Err(RenderError::ShaderCompileError { stage, log });
        }

        debug!("{} shader compiled ({} bytes)", stage, binary.len());
        Ok(guard)
    }
}

impl<D: RenderDevice> Drop for StageGuard<'_, D> {
    fn drop(&mut self) {
        self.device.delete_shader_stage(self.id);
        debug!("released {} shader stage {:?}", self.stage, self.id);
    }
}

/// Reads one precompiled stage binary from disk.
pub fn read_binary(path: &Path) -> Result<Vec<u8>, RenderError> {
    if !path.exists() {
        return Err(RenderError::AssetNotFound(path.to_path_buf()));
    }

    let bytes =
        fs::read(path).map_err(|e| RenderError::AssetReadError(path.to_path_buf(), e))?;
    if bytes.is_empty() {
        return Err(RenderError::AssetEmpty(path.to_path_buf()));
    }

    Ok(bytes)
}

/// Loads, compiles and links a vertex/fragment binary pair.
///
/// Both files are read before the device is touched, so a missing or empty
/// binary never allocates a handle.
pub fn load_program<D: RenderDevice>(
    device: &Rc<D>,
    vertex_path: &Path,
    fragment_path: &Path,
) -> Result<Program<D>, RenderError> {
    let vertex_binary = read_binary(vertex_path).inspect_err(|e| error!("{}", e))?;
    let fragment_binary = read_binary(fragment_path).inspect_err(|e| error!("{}", e))?;

    let vertex = StageGuard::compile(device.as_ref(), ShaderStage::Vertex, &vertex_binary)?;
    let fragment = StageGuard::compile(device.as_ref(), ShaderStage::Fragment, &fragment_binary)?;

    let program = Program {
        device: Rc::clone(device),
        id: device.link_program(vertex.id, fragment.id)?,
    };

    let status = device.program_status(program.id);
    if !status.ok {
        let log = truncate_log(&status.log);
        error!("program failed to link: {}", log);
        return Err(RenderError::ShaderLinkError { log });
    }

    info!(
        "linked program {:?} from {} and {}",
        program.id,
        vertex_path.display(),
        fragment_path.display()
    );
    Ok(program)
}

/// Reinterprets a blob as little-endian SPIR-V words.
///
/// Big-endian modules are byte-swapped. The error string is suitable as a
/// compile log.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "SPIR-V blob length {} is not a multiple of 4",
            bytes.len()
        ));
    }
    if bytes.len() < 20 {
        return Err("SPIR-V blob is shorter than its 5-word header".to_string());
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    match words[0] {
        SPIRV_MAGIC => Ok(words),
        magic if magic.swap_bytes() == SPIRV_MAGIC => {
            Ok(words.into_iter().map(u32::swap_bytes).collect())
        }
        magic => Err(format!("bad SPIR-V magic number {magic:#010x}")),
    }
}

/// Trims a driver log to [`MAX_INFO_LOG`] bytes on a character boundary.
fn truncate_log(log: &str) -> String {
    let log = log.trim_end_matches(['\0', '\n', ' ']);
    if log.len() <= MAX_INFO_LOG {
        return log.to_string();
    }
    let mut end = MAX_INFO_LOG;
    while !log.is_char_boundary(end) {
        end -= 1;
    }
    log[..end].to_string()
}
