mod diagnose;
mod netns;
mod network_policy;
mod packet;
