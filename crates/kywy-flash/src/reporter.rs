use std::io::Stdout;

use kywy_flash_core::reporter::ProgressReporter;
use pbr::{ProgressBar, Units};

/// Terminal progress bar, one per transfer.
#[derive(Default)]
pub struct ProgressBarReporter {
    pb: Option<ProgressBar<Stdout>>,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn start(&mut self, total_bytes: usize) {
        let mut pb = ProgressBar::new(total_bytes as u64);
        pb.set_units(Units::Bytes);
        self.pb = Some(pb);
    }

    fn advance(&mut self, bytes: usize) {
        if let Some(pb) = self.pb.as_mut() {
            pb.add(bytes as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(mut pb) = self.pb.take() {
            pb.finish();
            println!();
        }
    }
}
