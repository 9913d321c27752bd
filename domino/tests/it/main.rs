mod helper;
mod request_queue;

use domino::*;
use std::sync::Arc;

/// A messenger over a recording driver, started.
pub async fn started_messenger() -> (Messenger, Arc<helper::RecordingDriver>) {
    domino::setup_logger();

    let driver = helper::RecordingDriver::started().await;
    let messenger = Messenger::new(driver.clone(), MessengerConfig::default());

    (messenger, driver)
}
