//! Cluck is a low-bandwidth message bus for robot control networks: a process-wide [node::CluckNode]
//!  routes opaque, tag-prefixed byte payloads between named [node::Link]s, and TCP transports
//!  mirror a node's traffic to peer processes so that paths like `robot/drive/left` reach across
//!  machines.
//!
//! ```ascii
//!  console process                          robot process
//!  +-------------------+                    +-------------------+
//!  | CluckNode         |                    | CluckNode         |
//!  |   "robot" --------+---- TCP frames ----+-> "console"       |
//!  |   "rpc-endpoint"  |                    |   "drive"         |
//!  +-------------------+                    +-------------------+
//! ```
//!
//! Sending to `robot/drive` on the console routes through the console's `robot` link, which
//!  forwards `drive` (the remaining path) over TCP; the robot's node then delivers the message to
//!  its local `drive` link with source `console/...`, so replies find their way back.

pub mod error;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod tcp;
pub mod test_util;
pub mod util;
