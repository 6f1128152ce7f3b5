use {
    nix::unistd::{Gid, Group, Uid, User},
    std::{os::unix::prelude::*, path::Path},
    tnfs::fs::{FileKind, Metadata},
    tokio::fs,
};

/// Attributes of `path`, following symlinks
pub async fn get_metadata<T: AsRef<Path> + ?Sized>(path: &T) -> tnfs::Result<Metadata> {
    let path = path.as_ref();
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    Ok(metadata_from_attr(
        &fs::metadata(path).await?,
        name.as_deref().unwrap_or(""),
    ))
}

pub fn metadata_from_attr(attr: &std::fs::Metadata, name: &str) -> Metadata {
    let kind = match attr.file_type() {
        t if t.is_dir() => FileKind::Dir,
        t if t.is_file() => FileKind::File,
        _ => FileKind::Special,
    };

    Metadata {
        kind,
        mode: (attr.mode() & 0o7777) as u16,
        size: attr.size(),
        atime: attr.atime().clamp(0, u32::MAX as i64) as u32,
        mtime: attr.mtime().clamp(0, u32::MAX as i64) as u32,
        ctime: attr.ctime().clamp(0, u32::MAX as i64) as u32,
        uid: saturate_id(attr.uid()),
        gid: saturate_id(attr.gid()),
        user: user_name(attr.uid()),
        group: group_name(attr.gid()),
        hidden: name.starts_with('.'),
    }
}

/// Ids above the 16-bit wire field read as `u16::MAX`
fn saturate_id(id: u32) -> u16 {
    u16::try_from(id).unwrap_or(u16::MAX)
}

fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}
