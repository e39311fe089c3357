pub mod aggregator;

pub use self::aggregator::{ ChatEvent, StreamAggregator, SubmitOutcome };
