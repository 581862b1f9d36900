mod assembly;
mod context;
mod fixtures;
mod properties;
mod restriction;
