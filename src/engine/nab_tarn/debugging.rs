use std::sync::Once;

static LOG_INIT: Once = Once::new();

// Idempotent logger init for tests/tools; the app shell owns real logger configuration
pub fn init_test_logging()
{
    LOG_INIT.call_once(||
    {
        let _ = colog::basic_builder()
            .filter_level(log::LevelFilter::Debug)
            .try_init(); // another harness may have beaten us to it
    });
}
