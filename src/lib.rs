// Lucy — workspace-scoped AI coworker for Slack.
//
// The library exposes two layers:
//   atoms  — pure data types, constants, and the error enum
//   engine — everything that does work: workspace store, capability
//            index, router, tool execution, agent loop, cron scheduler,
//            chat transports, and the composition root

pub mod atoms;
pub mod engine;
