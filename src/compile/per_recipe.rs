//! One container per recipe.
//!
//! Each recipe is built with `make` in its own container. ELF files that
//! appear in the recipe directory during the build are moved to
//! `<output_dir>/<rel>/`.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{
    parse_library_flags, write_library_log, CompileRequest, CompileResult, LIBRARY_LOG_NAME,
    OUTPUT_MOUNT, REPO_MOUNT,
};
use crate::docker::{shell_quote, ContainerCommand, ContainerRunner, ContainerUser};
use crate::error::{CompileError, ContainerError};

const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
const EI_DATA: usize = 5;
const ELFDATA2MSB: u8 = 2;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// `make` invocation for one recipe.
pub fn make_command(compiler: &str, flags: &str) -> String {
    format!(
        "make --keep-going CC={} CFLAGS={}",
        shell_quote(compiler),
        shell_quote(flags)
    )
}

/// True if the file is a linked ELF executable or shared object.
///
/// Relocatable objects (`.o`) and core files carry the same magic and are
/// rejected by their `e_type`.
pub fn is_linked_elf(path: &Path) -> bool {
    let mut header = [0u8; 18];
    if std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .is_err()
    {
        return false;
    }
    if header[..4] != ELF_MAGIC {
        return false;
    }
    let e_type = [header[16], header[17]];
    let e_type = if header[EI_DATA] == ELFDATA2MSB {
        u16::from_be_bytes(e_type)
    } else {
        u16::from_le_bytes(e_type)
    };
    matches!(e_type, ET_EXEC | ET_DYN)
}

fn snapshot(dir: &Path) -> HashSet<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

/// Move a file, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

async fn compile_one(
    runner: &dyn ContainerRunner,
    request: &CompileRequest,
    recipe_dir: &Path,
    rel: &Path,
) -> Result<(CompileResult, BTreeSet<String>), CompileError> {
    let before = snapshot(recipe_dir);
    let cwd = Path::new(REPO_MOUNT).join(rel);
    let command = ContainerCommand::new(make_command(&request.compiler, &request.flags))
        .with_mount(&request.repo_path, REPO_MOUNT)
        .with_mount(&request.output_dir, OUTPUT_MOUNT)
        .with_cwd(cwd.to_string_lossy())
        .with_user(ContainerUser::Uid(request.container_uid))
        .with_timeout(request.timeout);

    let (success, output) = match runner.run(&command).await {
        Ok(result) => (result.success(), result.captured_output.unwrap_or_default()),
        Err(ContainerError::Timeout {
            timeout,
            captured_output,
            ..
        }) => {
            warn!(recipe = %rel.display(), ?timeout, "Recipe build timed out");
            (false, captured_output.unwrap_or_default())
        }
        Err(e) => return Err(e.into()),
    };

    let target_dir = request.output_dir.join(rel);
    let mut binaries = BTreeSet::new();
    for path in snapshot(recipe_dir).difference(&before) {
        if !is_linked_elf(path) {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let dest = target_dir.join(file_name);
        match move_file(path, &dest) {
            Ok(()) => {
                binaries.insert(rel.join(file_name));
            }
            Err(e) => debug!(path = %path.display(), error = %e, "Failed to move binary"),
        }
    }

    let libraries = if request.record_libraries {
        parse_library_flags(&output)
    } else {
        BTreeSet::new()
    };

    Ok((
        CompileResult {
            directory: rel.to_path_buf(),
            success,
            binaries,
            output,
        },
        libraries,
    ))
}

pub(crate) async fn compile(
    runner: &dyn ContainerRunner,
    request: &CompileRequest,
) -> Result<Vec<CompileResult>, CompileError> {
    let mut results = Vec::with_capacity(request.recipe_dirs.len());
    let mut libraries = BTreeSet::new();
    for (dir, rel) in request.recipe_dirs.iter().zip(request.relative_recipes()) {
        let (result, libs) = compile_one(runner, request, dir, &rel).await?;
        libraries.extend(libs);
        results.push(result);
    }
    if request.record_libraries {
        write_library_log(&request.output_dir.join(LIBRARY_LOG_NAME), &libraries)?;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{read_library_log, BatchCompiler, CompileMode};
    use crate::docker::CommandResult;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Minimal ELF header: magic, class, data encoding, version, then `e_type`.
    fn elf_header(e_type: u16, big_endian: bool) -> Vec<u8> {
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(&ELF_MAGIC);
        header[4] = 2;
        header[EI_DATA] = if big_endian { ELFDATA2MSB } else { 1 };
        header[6] = 1;
        let bytes = if big_endian {
            e_type.to_be_bytes()
        } else {
            e_type.to_le_bytes()
        };
        header[16..18].copy_from_slice(&bytes);
        header
    }

    /// Drops an executable and an object file into the recipe directory, like `make` would.
    struct MakeRunner;

    #[async_trait]
    impl ContainerRunner for MakeRunner {
        async fn run(&self, command: &ContainerCommand) -> Result<CommandResult, ContainerError> {
            let repo = command
                .mounts
                .iter()
                .find(|(_, c)| c == REPO_MOUNT)
                .map(|(h, _)| h.clone())
                .expect("repo mount");
            let cwd = command.cwd.clone().expect("cwd");
            let rel = Path::new(&cwd).strip_prefix(REPO_MOUNT).expect("prefix");
            let dir = repo.join(rel);
            if rel.as_os_str() == "broken" {
                return Ok(CommandResult {
                    command: command.command.clone(),
                    exit_code: 2,
                    captured_output: Some("make: *** [all] Error 1".to_string()),
                });
            }
            std::fs::write(dir.join("app"), elf_header(ET_EXEC, false)).expect("elf");
            std::fs::write(dir.join("app.o"), elf_header(1, false)).expect("obj");
            Ok(CommandResult {
                command: command.command.clone(),
                exit_code: 0,
                captured_output: Some("gcc -o app app.o -lm -lcurl".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_per_recipe_moves_new_elf_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("broken")).expect("mkdir");
        std::fs::write(repo.join("Makefile"), "all:").expect("write");
        // Pre-existing ELF files are not attributed to the build.
        std::fs::write(repo.join("prebuilt"), elf_header(ET_EXEC, false)).expect("write");

        let request = CompileRequest {
            output_dir: dir.path().join("out"),
            recipe_dirs: vec![repo.clone(), repo.join("broken")],
            repo_path: repo.clone(),
            compiler: "gcc".to_string(),
            flags: "-g -O1".to_string(),
            timeout: Some(Duration::from_secs(30)),
            record_libraries: true,
            container_uid: 30_000,
        };
        let compiler = BatchCompiler::new(Arc::new(MakeRunner), CompileMode::PerRecipe);
        let results = compiler.compile(&request).await.expect("compile");

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[0].binaries, BTreeSet::from([PathBuf::from("app")]));
        assert!(request.output_dir.join("app").exists());
        assert!(!repo.join("app").exists());
        assert!(repo.join("app.o").exists());
        assert!(repo.join("prebuilt").exists());

        assert!(!results[1].success);
        assert!(results[1].binaries.is_empty());

        let libs = read_library_log(&request.output_dir.join(LIBRARY_LOG_NAME)).expect("libs");
        assert_eq!(libs, BTreeSet::from(["curl".to_string(), "m".to_string()]));
    }

    #[test]
    fn test_make_command() {
        assert_eq!(
            make_command("clang", "-g -O1 -mllvm -fla"),
            "make --keep-going CC='clang' CFLAGS='-g -O1 -mllvm -fla'"
        );
    }

    #[test]
    fn test_is_linked_elf_accepts_executables_and_shared_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exec = dir.path().join("app");
        let shared = dir.path().join("libfoo.so");
        let big_endian = dir.path().join("mips-app");
        std::fs::write(&exec, elf_header(ET_EXEC, false)).expect("write");
        std::fs::write(&shared, elf_header(ET_DYN, false)).expect("write");
        std::fs::write(&big_endian, elf_header(ET_EXEC, true)).expect("write");
        assert!(is_linked_elf(&exec));
        assert!(is_linked_elf(&shared));
        assert!(is_linked_elf(&big_endian));
    }

    #[test]
    fn test_is_linked_elf_rejects_objects_and_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let object = dir.path().join("app.o");
        let core = dir.path().join("core");
        let truncated = dir.path().join("short");
        let text = dir.path().join("notes.txt");
        std::fs::write(&object, elf_header(1, false)).expect("write");
        std::fs::write(&core, elf_header(4, false)).expect("write");
        std::fs::write(&truncated, b"\x7fELF\x02\x01").expect("write");
        std::fs::write(&text, b"not an elf file at all").expect("write");
        assert!(!is_linked_elf(&object));
        assert!(!is_linked_elf(&core));
        assert!(!is_linked_elf(&truncated));
        assert!(!is_linked_elf(&text));
        assert!(!is_linked_elf(&dir.path().join("missing")));
    }
}
