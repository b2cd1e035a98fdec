pub mod install;

pub use install::{CertificateInstaller, DirectoryInstaller};
