/// Data layer: series table, sidecars, images, and run selection.
///
/// Architecture:
/// ```text
///  image_information.{csv,json,parquet}     *.json sidecars
///        │                                        │
///        ▼                                        ▼
///   ┌──────────┐                            ┌──────────┐
///   │  loader   │  parse table → SeriesTable │  loader   │  → Vec<BidsSidecar>
///   └──────────┘                            └──────────┘
///        │                                        │
///        └──────────────────┬─────────────────────┘
///                           ▼
///                    ┌─────────────┐
///                    │  selection   │  match sidecars, group by run
///                    └─────────────┘
///                           │
///                           ▼
///                    ┌─────────────┐
///                    │    nifti     │  read series images / write maps
///                    └─────────────┘
/// ```

pub mod loader;
pub mod model;
pub mod nifti;
pub mod selection;
