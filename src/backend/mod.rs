//! DICOM wire-level backend: the SCP admission path and the Export
//! Service's DICOM SCU sink both sit on top of this module's association,
//! C-ECHO, and C-STORE plumbing.

pub mod dimse;
