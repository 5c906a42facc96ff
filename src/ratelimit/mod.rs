//! Rate limiting algorithms, decorators and the limiter registry.

mod adaptive;
mod backend;
mod distributed;
mod fixed_window;
mod key;
mod policy;
mod presets;
mod registry;
mod result;
mod sliding_window;
mod sweeper;

pub use adaptive::{
    GeoAdaptive, GeoInfo, GeoPolicy, GeoResolver, HeaderGeoResolver, InFlightGuard, InFlightProbe,
    LoadAdaptive, LoadProbe, DEFAULT_ANONYMIZED_HEADER, DEFAULT_COUNTRY_HEADER,
};
pub use backend::RateLimiterBackend;
pub use distributed::{DistributedRateLimiter, DEFAULT_STORE_TIMEOUT};
pub use fixed_window::{FixedWindowLimiter, WindowRecord};
pub use key::{KeyExtractor, RequestContext, UNKNOWN_KEY};
pub use policy::{Outcome, RateLimitPolicy, TimeUnit, MAX_WINDOW};
pub use presets::{Algorithm, Preset};
pub use registry::Limiters;
pub use result::{RateLimitResult, TOO_MANY_REQUESTS};
pub use sliding_window::{HitLog, SlidingWindowLimiter};
pub(crate) use sliding_window::in_window;
pub use sweeper::{Sweep, SweepHandle, Sweeper};
