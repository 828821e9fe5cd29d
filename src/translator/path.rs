//! Virtual path -> backend path resolution

use std::path::{Component, Path, PathBuf};

/// Join a virtual path onto the mount root.
///
/// The virtual path is always treated as relative: a leading `/` does not
/// replace the root, `.` is dropped, and `..` never climbs above the root.
pub fn join(root: &Path, virtual_path: &Path) -> PathBuf {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for component in virtual_path.components() {
        match component {
            Component::Normal(name) => {
                resolved.push(name);
                depth += 1;
            }
            Component::ParentDir => {
                if depth > 0 {
                    resolved.pop();
                    depth -= 1;
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }

    resolved
}
