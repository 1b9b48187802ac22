//! Environment source: KOMAGEN__SECTION__KEY, e.g. KOMAGEN__SERVICE__BASE_URL.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::Environment;

pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("KOMAGEN")
            .separator("__")
            .try_parsing(true),
    )
}
