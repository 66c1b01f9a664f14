use std::collections::HashSet;
use std::path::Path;

/// Returns `desired` when `exists` rejects it, otherwise the first free
/// `base(N)ext` with `N` counting from 1. Directories are never split at a
/// dot.
pub fn generate_dup_name(exists: impl Fn(&str) -> bool, desired: &str, is_file: bool) -> String {
    if !exists(desired) {
        return desired.to_string();
    }
    let (base, ext) = if is_file {
        split_extension(desired)
    } else {
        (desired, "")
    };
    let mut n: u64 = 1;
    loop {
        let candidate = format!("{base}({n}){ext}");
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Resolves against a listing of the destination directory.
pub fn dup_name_in(names: &HashSet<String>, desired: &str, is_file: bool) -> String {
    generate_dup_name(|name| names.contains(name), desired, is_file)
}

/// Resolves against the entries of a local directory.
pub fn local_dup_name(dir: &Path, desired: &str, is_file: bool) -> String {
    generate_dup_name(|name| dir.join(name).symlink_metadata().is_ok(), desired, is_file)
}

/// `a.tar.gz` splits into `a.tar` and `.gz`; hidden files without a second
/// dot keep their whole name as the base.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}
