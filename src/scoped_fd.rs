use nix::unistd::close;
use std::os::unix::io::RawFd;

/// Owns a raw fd and closes it on drop. Deliberately not Clone.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn new_from_fd(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Swallow any error on close.
            close(self.fd).unwrap_or(());
        }
        self.fd = -1;
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }
}
