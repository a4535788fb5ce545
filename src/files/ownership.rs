// src/files/ownership.rs

//! uid/gid ↔ name lookups for inode streams

use std::ffi::{CStr, CString};

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

/// User name for `uid`, or the decimal uid when there is no passwd entry
pub fn user_name(uid: u32) -> String {
    // SAFETY: getpwuid returns null or a pointer to static storage that we
    // copy out before any other passwd call
    unsafe {
        let pwd = libc::getpwuid(uid);
        if pwd.is_null() || (*pwd).pw_name.is_null() {
            return uid.to_string();
        }
        CStr::from_ptr((*pwd).pw_name).to_string_lossy().into_owned()
    }
}

/// Group name for `gid`, or the decimal gid when there is no group entry
pub fn group_name(gid: u32) -> String {
    // SAFETY: as for getpwuid
    unsafe {
        let grp = libc::getgrgid(gid);
        if grp.is_null() || (*grp).gr_name.is_null() {
            return gid.to_string();
        }
        CStr::from_ptr((*grp).gr_name).to_string_lossy().into_owned()
    }
}

pub fn uid_for(name: &str) -> Option<u32> {
    if let Ok(uid) = name.parse() {
        return Some(uid);
    }
    let c_name = CString::new(name).ok()?;
    // SAFETY: c_name outlives the call; the result is read immediately
    unsafe {
        let pwd = libc::getpwnam(c_name.as_ptr());
        if pwd.is_null() { None } else { Some((*pwd).pw_uid) }
    }
}

pub fn gid_for(name: &str) -> Option<u32> {
    if let Ok(gid) = name.parse() {
        return Some(gid);
    }
    let c_name = CString::new(name).ok()?;
    // SAFETY: as for getpwnam
    unsafe {
        let grp = libc::getgrnam(c_name.as_ptr());
        if grp.is_null() { None } else { Some((*grp).gr_gid) }
    }
}
