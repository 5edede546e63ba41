pub(crate) mod access_path;
pub(crate) mod lattice;
pub(crate) mod worklist;
