/// Thermometry engine: from multi-echo magnitude signals to temperatures.
///
/// ```text
///   series images ──► echo::EchoStack ──┐
///   segmentation  ──► regions::Region ──┤
///                                       ▼
///                              methods::run_method
///                     (regionwise | voxelwise | regionwise_bootstrap)
///                                       │
///                     fit::fit_beat ◄───┤───► bootstrap::bootstrap_region
///                                       ▼
///                     calibration: Δf → Δδ → temperature
/// ```

pub mod bootstrap;
pub mod calibration;
pub mod echo;
pub mod fit;
pub mod methods;
pub mod regions;
pub mod stats;
