/*! Communication between endpoints.

The `socket` module holds the transport protocol state machines. They never
own memory of their own: every segment they queue is a
[Packet](crate::storage::Packet) borrowed from one of the stack's pools, and
applications hand data in and take it out as packets too.

Connections are not used directly; they live inside a
[Stack](crate::iface::Stack) and are named by a
[ConnectionHandle](tcp::ConnectionHandle).
*/

pub mod tcp;
